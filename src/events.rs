//! Change events and ordering metadata.
//!
//! A [`ChangeEvent`] is the unit of invalidation: "some row in `table`
//! changed". Payload content beyond the table identifier is deliberately not
//! trusted; the invalidation decision depends only on `table`, so malformed
//! or unknown payloads degrade to an `Unknown` kind instead of being
//! dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::tables::TableId;

/// Monotonic per-process sequence number.
///
/// Assigned at the moment an event enters the local pipeline; used for
/// ordering diagnostics when interleaving remote and locally synthesized
/// events. Delivery order remains authoritative.
pub type Epoch = u64;

/// What happened to the row. Only diagnostic: every kind invalidates alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Unknown,
}

impl ChangeKind {
    /// Parse a wire label, tolerating kinds this client does not know.
    pub fn from_wire(label: &str) -> Self {
        match label {
            "insert" => ChangeKind::Insert,
            "update" => ChangeKind::Update,
            "delete" => ChangeKind::Delete,
            _ => ChangeKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::Unknown => "unknown",
        }
    }
}

/// Where an event entered the pipeline.
///
/// `Local` events are synthesized by [`crate::trigger::WriteTrigger`] after
/// a successful mutation; the remote notification for the same write may
/// also arrive. Both paths are tolerated because invalidation is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventOrigin {
    Remote,
    Local,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Remote => "remote",
            EventOrigin::Local => "local",
        }
    }
}

/// Notification that some row in a table was inserted, updated, or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique identifier, for log correlation.
    pub id: Uuid,
    /// Local arrival sequence number.
    pub epoch: Epoch,
    /// The collection that changed. The only field invalidation trusts.
    pub table: TableId,
    pub kind: ChangeKind,
    pub occurred_at: OffsetDateTime,
    pub origin: EventOrigin,
}

impl ChangeEvent {
    pub fn remote(table: TableId, kind: ChangeKind, epoch: Epoch) -> Self {
        Self::new(table, kind, epoch, EventOrigin::Remote)
    }

    pub fn local(table: TableId, kind: ChangeKind, epoch: Epoch) -> Self {
        Self::new(table, kind, epoch, EventOrigin::Local)
    }

    fn new(table: TableId, kind: ChangeKind, epoch: Epoch, origin: EventOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            table,
            kind,
            occurred_at: OffsetDateTime::now_utc(),
            origin,
        }
    }
}

/// Shared epoch allocator.
///
/// One counter per runtime, shared by the channel (remote arrivals) and the
/// write trigger (local events), so epochs interleave in pipeline order.
#[derive(Debug, Default)]
pub struct EpochCounter(AtomicU64);

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Epoch {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
