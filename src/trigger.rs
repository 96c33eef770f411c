//! Local write path into the invalidation pipeline.
//!
//! After a successful remote mutation the feature layer may call the
//! trigger instead of (or as well as) waiting for the store's change
//! notification; the design tolerates either or both paths firing, since
//! invalidation is idempotent. Mutation failures never come through here:
//! they surface to the mutation caller, at most once, with no hidden retry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{ChangeEvent, ChangeKind, EpochCounter};
use crate::tables::TableId;

/// Publishes locally originated change events into the consumer queue.
#[derive(Clone)]
pub struct WriteTrigger {
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    epochs: Arc<EpochCounter>,
}

impl WriteTrigger {
    pub fn new(events_tx: mpsc::UnboundedSender<ChangeEvent>, epochs: Arc<EpochCounter>) -> Self {
        Self { events_tx, epochs }
    }

    /// Record that a mutation touched `table`.
    pub fn changed(&self, table: TableId, kind: ChangeKind) {
        let event = ChangeEvent::local(table, kind, self.epochs.next());
        debug!(
            event_id = %event.id,
            table = %table,
            kind = kind.as_str(),
            "Local write event published"
        );
        let _ = self.events_tx.send(event);
    }

    pub fn inserted(&self, table: TableId) {
        self.changed(table, ChangeKind::Insert);
    }

    pub fn updated(&self, table: TableId) {
        self.changed(table, ChangeKind::Update);
    }

    pub fn deleted(&self, table: TableId) {
        self.changed(table, ChangeKind::Delete);
    }
}
