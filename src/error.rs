//! Error taxonomy for the synchronization layer.
//!
//! Nothing in this subsystem is fatal to the embedding process: connection
//! loss feeds the reconnect loop, fetch failures surface on the affected
//! cache entry, and mutation failures go back to the caller untouched.

use thiserror::Error;

/// Transport-level failure of the change-notification connection.
///
/// Consumed internally by the channel's reconnect loop; observable through
/// logs and metrics, never propagated as an unhandled fault.
#[derive(Debug, Clone, Error)]
#[error("change stream connection failed: {message}")]
pub struct ConnectionError {
    pub message: String,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of a per-key fetch.
///
/// Recorded on the cache entry as `Errored`; the previous value stays
/// readable. Transient errors are expected to succeed on a later retry,
/// permanent ones will keep failing until the underlying cause is fixed.
/// The cache retries both the next time freshness is requested.
#[derive(Debug, Clone, Error)]
#[error("fetch failed: {message}")]
pub struct FetchError {
    pub message: String,
    pub transient: bool,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Failure of a remote write.
///
/// Surfaced directly to the mutation caller. Never retried here:
/// at-most-once semantics, a hidden retry could double-write.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error("mutation rejected by the store: {0}")]
    Rejected(String),
    #[error("mutation transport failed: {0}")]
    Transport(String),
}

/// Umbrella error for embedders that want a single error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
