//! Seam to the remote change-notification source.
//!
//! The sync layer never speaks a concrete wire protocol. Whatever carries
//! the notifications (a WebSocket, an SSE stream, a message queue binding)
//! implements these two traits and is injected into the runtime.

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::events::ChangeEvent;
use crate::tables::TableSet;

/// Factory for physical connections to the change-notification source.
///
/// `connect` is called once per (re)connection attempt by the channel's
/// background task; implementations must not retry internally, backoff is
/// the channel's job.
#[async_trait]
pub trait ChangeTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>, ConnectionError>;
}

/// One live connection.
///
/// Contract, per the source's interface:
/// - `subscribe` / `unsubscribe` are idempotent; subscribing a table that is
///   already subscribed (or unsubscribing one that is not) is a no-op.
/// - `next_event` yields events in FIFO order for this connection.
///   `Some(Err(_))` and `None` both mean the connection is unusable; the
///   channel drops the stream and reconnects, then re-issues `subscribe`
///   for its full desired set.
#[async_trait]
pub trait ChangeStream: Send {
    async fn subscribe(&mut self, tables: &TableSet) -> Result<(), ConnectionError>;

    async fn unsubscribe(&mut self, tables: &TableSet) -> Result<(), ConnectionError>;

    async fn next_event(&mut self) -> Option<Result<ChangeEvent, ConnectionError>>;
}
