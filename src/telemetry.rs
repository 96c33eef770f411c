//! Tracing subscriber installation and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::SyncError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Intended for binaries and integration harnesses that embed the runtime;
/// applications with their own subscriber should skip this and only call
/// [`describe_metrics`].
pub fn init(logging: &LoggingSettings) -> Result<(), SyncError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from(logging.level).into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            SyncError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "marea_change_events_total",
            Unit::Count,
            "Total change events processed by the invalidator, labeled by origin and kind."
        );
        describe_counter!(
            "marea_invalidated_entries_total",
            Unit::Count,
            "Total cache entries marked stale by invalidation passes."
        );
        describe_counter!(
            "marea_fetch_coalesced_total",
            Unit::Count,
            "Total ensure-fresh calls that joined an already in-flight fetch."
        );
        describe_counter!(
            "marea_refetch_spawned_total",
            Unit::Count,
            "Total background refetches spawned for watched entries after invalidation."
        );
        describe_counter!(
            "marea_fetch_errors_total",
            Unit::Count,
            "Total fetches that failed and left their entry in the errored state."
        );
        describe_counter!(
            "marea_reconnect_attempts_total",
            Unit::Count,
            "Total reconnection attempts made by the change-event channel."
        );
        describe_gauge!(
            "marea_active_tables",
            Unit::Count,
            "Current number of tables desired by live subscription handles."
        );
        describe_histogram!(
            "marea_fetch_ms",
            Unit::Milliseconds,
            "Per-key fetch latency in milliseconds."
        );
        describe_histogram!(
            "marea_invalidation_pass_ms",
            Unit::Milliseconds,
            "Latency of one event's invalidation pass in milliseconds."
        );
    });
}
