//! Shared change-event connection.
//!
//! One physical connection per runtime, multiplexing every feature's table
//! interest. A background task owns the transport stream; the public
//! [`ChangeEventChannel`] handle talks to it over a command queue. The task
//! reconciles the wire subscription against the desired table set, fans
//! events out to listeners in arrival order, and reconnects with uncapped
//! exponential backoff when the transport drops, re-issuing the full
//! desired set before resuming delivery.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::ConnectionError;
use crate::events::{ChangeEvent, EpochCounter};
use crate::tables::TableSet;
use crate::transport::{ChangeStream, ChangeTransport};

const METRIC_RECONNECT_ATTEMPTS: &str = "marea_reconnect_attempts_total";

/// Commands sent from the public handle to the background task.
enum ChannelCmd {
    /// Establish the connection if absent; ack once the next attempt
    /// resolves. Idempotent.
    Connect {
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    /// Reconcile the wire subscription to exactly this set.
    SetDesiredTables { tables: TableSet },
    /// Register an event listener.
    AddListener {
        tx: mpsc::UnboundedSender<ChangeEvent>,
    },
    /// Release the connection; the desired set is retained.
    Disconnect,
    /// Terminate the background task.
    Shutdown,
}

/// Work the select arms defer until the stream borrow is released.
enum Post {
    Nothing,
    /// Re-run the wire reconciliation against the active stream.
    Reconcile,
    /// Connection is unusable; drop it and let the reconnect path run.
    DropStream,
    Shutdown,
}

/// Handle to the shared change-event connection. Cheap to clone.
#[derive(Clone)]
pub struct ChangeEventChannel {
    cmd_tx: mpsc::Sender<ChannelCmd>,
    connected: Arc<AtomicBool>,
}

impl ChangeEventChannel {
    /// Spawn the background connection task. The connection itself is
    /// established lazily: on [`connect`](Self::connect) or on the first
    /// non-empty desired set.
    pub fn spawn(
        transport: Arc<dyn ChangeTransport>,
        settings: &SyncSettings,
        epochs: Arc<EpochCounter>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.command_buffer_non_zero());
        let connected = Arc::new(AtomicBool::new(false));

        let task = ChannelTask {
            transport,
            epochs,
            desired: TableSet::new(),
            wire: TableSet::new(),
            listeners: Vec::new(),
            pending_acks: Vec::new(),
            connected: connected.clone(),
            want_connection: false,
            attempts: 0,
            initial_delay: settings.reconnect_initial_delay(),
            max_delay: settings.reconnect_max_delay(),
        };
        tokio::spawn(task.run(cmd_rx));

        Self { cmd_tx, connected }
    }

    /// Establish the physical connection if not already established.
    /// Resolves after the next attempt: `Ok` when the transport came up,
    /// the attempt's `ConnectionError` otherwise (the task keeps retrying
    /// with backoff either way).
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(ChannelCmd::Connect { done: done_tx }).await?;
        done_rx
            .await
            .map_err(|_| ConnectionError::new("change channel is shut down"))?
    }

    /// Reconcile the wire subscription to exactly `tables`. A non-empty set
    /// while disconnected re-triggers connection.
    pub async fn set_desired_tables(&self, tables: TableSet) {
        let _ = self.send(ChannelCmd::SetDesiredTables { tables }).await;
    }

    /// Register a listener fed every event in arrival order.
    pub async fn add_listener(&self, tx: mpsc::UnboundedSender<ChangeEvent>) {
        let _ = self.send(ChannelCmd::AddListener { tx }).await;
    }

    /// Convenience wrapper around [`add_listener`](Self::add_listener).
    pub async fn events(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_listener(tx).await;
        rx
    }

    /// Release the connection. A later `set_desired_tables` with a
    /// non-empty set (or `connect`) re-establishes it.
    pub async fn disconnect(&self) {
        let _ = self.send(ChannelCmd::Disconnect).await;
    }

    /// Terminate the background task. Listeners see their streams close.
    pub async fn shutdown(&self) {
        let _ = self.send(ChannelCmd::Shutdown).await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, cmd: ChannelCmd) -> Result<(), ConnectionError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ConnectionError::new("change channel is shut down"))
    }
}

/// State owned by the background task.
struct ChannelTask {
    transport: Arc<dyn ChangeTransport>,
    epochs: Arc<EpochCounter>,
    desired: TableSet,
    /// Tables currently subscribed on the wire. Reset on reconnect.
    wire: TableSet,
    listeners: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    /// Connect callers waiting for the next attempt to resolve.
    pending_acks: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
    connected: Arc<AtomicBool>,
    want_connection: bool,
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ChannelTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ChannelCmd>) {
        let mut stream: Option<Box<dyn ChangeStream>> = None;

        loop {
            let post = if let Some(active) = stream.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => self.on_cmd_connected(cmd),
                    event = active.next_event() => self.on_event(event),
                }
            } else if self.want_connection {
                match self.try_connect().await {
                    Ok(connected_stream) => {
                        stream = Some(connected_stream);
                        self.connected.store(true, Ordering::SeqCst);
                        self.attempts = 0;
                        self.resolve_acks(Ok(()));
                        info!(tables = %self.desired, "Change channel connected");
                        Post::Nothing
                    }
                    Err(err) => {
                        counter!(METRIC_RECONNECT_ATTEMPTS).increment(1);
                        self.attempts = self.attempts.saturating_add(1);
                        let delay =
                            backoff_delay(self.initial_delay, self.max_delay, self.attempts - 1);
                        warn!(
                            error = %err,
                            attempt = self.attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Change channel connect failed; backing off"
                        );
                        self.resolve_acks(Err(err));

                        // Stay responsive to commands while backing off.
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => Post::Nothing,
                            cmd = cmd_rx.recv() => self.on_cmd_disconnected(cmd),
                        }
                    }
                }
            } else {
                // Idle: nobody wants a connection, nothing to deliver.
                let cmd = cmd_rx.recv().await;
                self.on_cmd_disconnected(cmd)
            };

            match post {
                Post::Nothing => {}
                Post::Reconcile => {
                    let mut failed = false;
                    if let Some(active) = stream.as_mut() {
                        if let Err(err) =
                            reconcile(active.as_mut(), &mut self.wire, &self.desired).await
                        {
                            warn!(error = %err, "Subscription reconcile failed; reconnecting");
                            failed = true;
                        }
                    }
                    if failed {
                        stream = None;
                        self.mark_disconnected();
                    }
                }
                Post::DropStream => {
                    stream = None;
                    self.mark_disconnected();
                }
                Post::Shutdown => {
                    self.mark_disconnected();
                    return;
                }
            }
        }
    }

    /// Handle a command while the stream is up.
    fn on_cmd_connected(&mut self, cmd: Option<ChannelCmd>) -> Post {
        match cmd {
            Some(ChannelCmd::Connect { done }) => {
                let _ = done.send(Ok(()));
                Post::Nothing
            }
            Some(ChannelCmd::SetDesiredTables { tables }) => {
                self.desired = tables;
                if !self.desired.is_empty() {
                    self.want_connection = true;
                }
                Post::Reconcile
            }
            Some(ChannelCmd::AddListener { tx }) => {
                self.listeners.push(tx);
                Post::Nothing
            }
            Some(ChannelCmd::Disconnect) => {
                self.want_connection = false;
                info!("Change channel disconnected on request");
                Post::DropStream
            }
            Some(ChannelCmd::Shutdown) | None => Post::Shutdown,
        }
    }

    /// Handle a command while no stream is active.
    fn on_cmd_disconnected(&mut self, cmd: Option<ChannelCmd>) -> Post {
        match cmd {
            Some(ChannelCmd::Connect { done }) => {
                self.want_connection = true;
                self.pending_acks.push(done);
                Post::Nothing
            }
            Some(ChannelCmd::SetDesiredTables { tables }) => {
                self.desired = tables;
                if !self.desired.is_empty() {
                    self.want_connection = true;
                }
                Post::Nothing
            }
            Some(ChannelCmd::AddListener { tx }) => {
                self.listeners.push(tx);
                Post::Nothing
            }
            Some(ChannelCmd::Disconnect) => {
                self.want_connection = false;
                Post::Nothing
            }
            Some(ChannelCmd::Shutdown) | None => Post::Shutdown,
        }
    }

    fn on_event(&mut self, event: Option<Result<ChangeEvent, ConnectionError>>) -> Post {
        match event {
            Some(Ok(mut event)) => {
                event.epoch = self.epochs.next();
                debug!(
                    event_id = %event.id,
                    table = %event.table,
                    kind = event.kind.as_str(),
                    epoch = event.epoch,
                    "Change event received"
                );
                self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
                Post::Nothing
            }
            Some(Err(err)) => {
                warn!(error = %err, "Change stream failed; reconnecting");
                Post::DropStream
            }
            None => {
                warn!("Change stream ended; reconnecting");
                Post::DropStream
            }
        }
    }

    /// One connection attempt: transport connect, then subscribe the full
    /// desired set before any event is delivered.
    async fn try_connect(&mut self) -> Result<Box<dyn ChangeStream>, ConnectionError> {
        let mut stream = self.transport.connect().await?;
        self.wire = TableSet::new();
        reconcile(stream.as_mut(), &mut self.wire, &self.desired).await?;
        Ok(stream)
    }

    fn mark_disconnected(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.wire = TableSet::new();
    }

    fn resolve_acks(&mut self, result: Result<(), ConnectionError>) {
        for ack in self.pending_acks.drain(..) {
            let _ = ack.send(result.clone());
        }
    }
}

/// Diff the wire subscription against the desired set and apply the delta.
async fn reconcile(
    stream: &mut dyn ChangeStream,
    wire: &mut TableSet,
    desired: &TableSet,
) -> Result<(), ConnectionError> {
    let added = desired.difference(wire);
    let removed = wire.difference(desired);

    if !added.is_empty() {
        stream.subscribe(&added).await?;
    }
    if !removed.is_empty() {
        stream.unsubscribe(&removed).await?;
    }
    if !added.is_empty() || !removed.is_empty() {
        debug!(added = %added, removed = %removed, now = %desired, "Wire subscription reconciled");
    }
    *wire = desired.clone();
    Ok(())
}

/// Backoff delay for the given attempt: exponential from `initial`, capped
/// at `max`, with deterministic ±20% jitter derived from the attempt
/// counter so concurrent clients do not stampede in lockstep.
fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponential = initial.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    jittered(exponential.min(max), attempt)
}

fn jittered(base: Duration, seed: u32) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    // ±20% window.
    let span = (base_ms / 5).max(1);

    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let offset = (hasher.finish() % (2 * span + 1)) as i64 - span as i64;

    Duration::from_millis(base_ms.saturating_add_signed(offset))
}
