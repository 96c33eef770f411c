//! Assembly of the synchronization pipeline.
//!
//! Wires the change-event channel, subscription registry, query cache,
//! write trigger, and invalidator loop into one runtime the embedding
//! application owns. Features receive the registry/cache/trigger by
//! reference from here; there is no ambient global state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::ChangeEventChannel;
use crate::config::SyncSettings;
use crate::consumer::CacheInvalidator;
use crate::error::ConnectionError;
use crate::events::EpochCounter;
use crate::registry::SubscriptionRegistry;
use crate::store::QueryCache;
use crate::transport::ChangeTransport;
use crate::trigger::WriteTrigger;

/// The live cache-consistency runtime.
///
/// Connection is lazy: it is established on [`connect`](Self::connect) or
/// as soon as the first registered feature makes the desired table set
/// non-empty.
pub struct SyncRuntime<V> {
    channel: ChangeEventChannel,
    cache: Arc<QueryCache<V>>,
    registry: Arc<SubscriptionRegistry>,
    trigger: WriteTrigger,
    consumer_task: JoinHandle<()>,
}

impl<V: Clone + Send + Sync + 'static> SyncRuntime<V> {
    /// Assemble the pipeline and spawn its background tasks.
    pub async fn start(settings: SyncSettings, transport: Arc<dyn ChangeTransport>) -> Self {
        let epochs = Arc::new(EpochCounter::new());
        let channel = ChangeEventChannel::spawn(transport, &settings, epochs.clone());

        // Remote arrivals and local write events merge into one queue so
        // the invalidator processes everything in delivery order.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        channel.add_listener(events_tx.clone()).await;
        let trigger = WriteTrigger::new(events_tx, epochs);

        let cache = QueryCache::new(&settings);
        let registry = Arc::new(SubscriptionRegistry::new(channel.clone()));

        let invalidator = CacheInvalidator::new(cache.clone(), registry.clone());
        let consumer_task = tokio::spawn(invalidator.run(events_rx));

        Self {
            channel,
            cache,
            registry,
            trigger,
            consumer_task,
        }
    }

    /// Establish the change-event connection now instead of lazily.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.channel.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn cache(&self) -> &Arc<QueryCache<V>> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn trigger(&self) -> &WriteTrigger {
        &self.trigger
    }

    pub fn channel(&self) -> &ChangeEventChannel {
        &self.channel
    }

    /// Tear the pipeline down: stop the channel task, close the event
    /// queue, and wait for the invalidator to drain.
    pub async fn shutdown(self) {
        self.channel.shutdown().await;
        // The channel task held one event sender (as a listener) and the
        // trigger holds the other; dropping both closes the queue.
        drop(self.trigger);
        let _ = self.consumer_task.await;
        debug!("Sync runtime shut down");
    }
}
