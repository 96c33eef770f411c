//! Configuration for the synchronization runtime.
//!
//! Settings deserialize from a TOML file layered under environment
//! variables (`MAREA_` prefix, `__` separator), the same precedence the
//! embedding application uses for the rest of its configuration:
//!
//! ```toml
//! [sync]
//! reconnect_initial_delay_ms = 500
//! reconnect_max_delay_ms = 30000
//! refetch_watched = true
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::SyncError;

const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_COMMAND_BUFFER: usize = 256;
const ENV_PREFIX: &str = "MAREA";

/// Tuning for the synchronization runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// First reconnect delay after a transport loss.
    pub reconnect_initial_delay_ms: u64,
    /// Backoff ceiling; delays double per attempt up to this cap.
    pub reconnect_max_delay_ms: u64,
    /// Capacity of the channel's command queue.
    pub command_buffer: usize,
    /// Automatically refetch invalidated entries that still have watchers.
    /// Disabling degrades to manual-refresh behavior.
    pub refetch_watched: bool,
    pub logging: LoggingSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reconnect_initial_delay_ms: DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            refetch_watched: true,
            logging: LoggingSettings::default(),
        }
    }
}

impl SyncSettings {
    /// Load settings from an optional file layered under `MAREA_*`
    /// environment variables. A missing file is not an error; env-only
    /// configuration is valid.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| SyncError::configuration(err.to_string()))
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Command queue capacity, clamped to at least 1.
    pub fn command_buffer_non_zero(&self) -> usize {
        self.command_buffer.max(1)
    }
}

/// Log verbosity, convertible to a `tracing` level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::level_filters::LevelFilter {
    fn from(level: LogLevel) -> Self {
        use tracing::level_filters::LevelFilter;
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
        }
    }
}
