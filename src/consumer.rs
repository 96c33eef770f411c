//! Event → invalidation glue.
//!
//! One serialized loop consumes the merged change-event stream (remote
//! arrivals and locally triggered writes) in delivery order. Per event it
//! resolves the static table map plus any feature-declared extra keys and
//! marks the matching cache entries stale: exactly one pass per delivered
//! event, never fabricating or suppressing one. Duplicate delivery costs a
//! no-op pass because invalidation is idempotent.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::events::ChangeEvent;
use crate::invalidation::affected_patterns;
use crate::keys::KeyPattern;
use crate::registry::SubscriptionRegistry;
use crate::store::QueryCache;

const METRIC_CHANGE_EVENTS: &str = "marea_change_events_total";
const METRIC_INVALIDATION_PASS_MS: &str = "marea_invalidation_pass_ms";

/// Applies each delivered change event to the query cache.
pub struct CacheInvalidator<V> {
    cache: Arc<QueryCache<V>>,
    registry: Arc<SubscriptionRegistry>,
}

impl<V: Clone + Send + Sync + 'static> CacheInvalidator<V> {
    pub fn new(cache: Arc<QueryCache<V>>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { cache, registry }
    }

    /// Consume events until every sender is gone.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ChangeEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(&event);
        }
        debug!("Change event stream closed; invalidator stopping");
    }

    /// One invalidation pass for one event.
    #[instrument(skip(self, event), fields(event_id = %event.id, table = %event.table))]
    pub fn apply(&self, event: &ChangeEvent) {
        let started_at = Instant::now();

        let mut patterns = affected_patterns(event.table);
        for key in self.registry.extra_keys_for(event.table) {
            patterns.push(KeyPattern::of(&key));
        }

        let mut stale_entries = 0;
        for pattern in &patterns {
            stale_entries += self.cache.invalidate(pattern);
        }

        counter!(
            METRIC_CHANGE_EVENTS,
            "origin" => event.origin.as_str(),
            "kind" => event.kind.as_str(),
        )
        .increment(1);
        histogram!(METRIC_INVALIDATION_PASS_MS)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        debug!(
            kind = event.kind.as_str(),
            origin = event.origin.as_str(),
            epoch = event.epoch,
            patterns = patterns.len(),
            stale_entries,
            "Invalidation pass complete"
        );
    }
}
