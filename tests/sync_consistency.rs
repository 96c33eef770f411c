//! End-to-end consistency tests over a scripted in-memory transport.
//!
//! The transport records what the channel subscribes, lets tests push
//! change events, and can fail connection attempts or drop the stream to
//! exercise the reconnect path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use marea::{
    CacheKey, ChangeEvent, ChangeKind, ChangeStream, ChangeTransport, ConnectionError,
    DerivedView, EntryStatus, FetchError, KeyPattern, SyncRuntime, SyncSettings, TableId,
    TableSet,
};

// ---------------------------------------------------------------------------
// Scripted transport
// ---------------------------------------------------------------------------

type EventResult = Result<ChangeEvent, ConnectionError>;

#[derive(Default)]
struct TransportState {
    subscribed: Mutex<TableSet>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<EventResult>>>,
    connects: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl TransportState {
    fn push(&self, table: TableId, kind: ChangeKind) {
        let guard = self.event_tx.lock().expect("event slot");
        let tx = guard.as_ref().expect("transport should be connected");
        tx.send(Ok(ChangeEvent::remote(table, kind, 0)))
            .expect("stream should be alive");
    }

    /// Sever the live stream; the channel sees it end and reconnects.
    fn drop_connection(&self) {
        *self.event_tx.lock().expect("event slot") = None;
    }

    fn subscribed(&self) -> TableSet {
        self.subscribed.lock().expect("subscribed set").clone()
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

struct ScriptedTransport {
    state: Arc<TransportState>,
}

impl ScriptedTransport {
    fn new() -> (Arc<TransportState>, Arc<dyn ChangeTransport>) {
        let state = Arc::new(TransportState::default());
        let transport = Arc::new(ScriptedTransport {
            state: state.clone(),
        });
        (state, transport)
    }

    fn failing_first(failures: usize) -> (Arc<TransportState>, Arc<dyn ChangeTransport>) {
        let (state, transport) = Self::new();
        state.failures_remaining.store(failures, Ordering::SeqCst);
        (state, transport)
    }
}

#[async_trait]
impl ChangeTransport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>, ConnectionError> {
        let remaining = self.state.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectionError::new("scripted connect failure"));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.event_tx.lock().expect("event slot") = Some(tx);
        *self.state.subscribed.lock().expect("subscribed set") = TableSet::new();
        Ok(Box::new(ScriptedStream {
            rx,
            state: self.state.clone(),
        }))
    }
}

struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<EventResult>,
    state: Arc<TransportState>,
}

#[async_trait]
impl ChangeStream for ScriptedStream {
    async fn subscribe(&mut self, tables: &TableSet) -> Result<(), ConnectionError> {
        self.state
            .subscribed
            .lock()
            .expect("subscribed set")
            .extend(tables);
        Ok(())
    }

    async fn unsubscribe(&mut self, tables: &TableSet) -> Result<(), ConnectionError> {
        let mut subscribed = self.state.subscribed.lock().expect("subscribed set");
        for table in tables.iter() {
            subscribed.remove(table);
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<EventResult> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_settings() -> SyncSettings {
    SyncSettings {
        reconnect_initial_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        ..Default::default()
    }
}

fn tables(list: &[TableId]) -> TableSet {
    list.iter().copied().collect()
}

/// Poll `predicate` until it holds or a 2s deadline passes.
async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn counted_fetcher(
    calls: &Arc<AtomicUsize>,
    value: Value,
) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Value, FetchError>>
+ Send
+ Sync
+ 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Feature A watches `tasks` with a supplementary by-status key; feature B
/// watches `projects`. A delete on `tasks` stales and refetches A's keys
/// while B observes nothing.
#[tokio::test]
async fn delete_event_refreshes_interested_feature_only() {
    let (state, transport) = ScriptedTransport::new();
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;
    let cache = runtime.cache();

    let tasks_key = CacheKey::table(TableId::Tasks);
    let by_status_key = CacheKey::table(TableId::Tasks).text("by-status");
    let projects_key = CacheKey::table(TableId::Projects);

    let _feature_a = runtime
        .registry()
        .register(tables(&[TableId::Tasks]), vec![by_status_key.clone()])
        .await;
    let _feature_b = runtime
        .registry()
        .register(tables(&[TableId::Projects]), vec![])
        .await;
    wait_until("tasks and projects subscribed", || {
        let subscribed = state.subscribed();
        subscribed.contains(TableId::Tasks) && subscribed.contains(TableId::Projects)
    })
    .await;

    let tasks_calls = Arc::new(AtomicUsize::new(0));
    let by_status_calls = Arc::new(AtomicUsize::new(0));
    let projects_calls = Arc::new(AtomicUsize::new(0));

    cache
        .ensure_fresh(&tasks_key, counted_fetcher(&tasks_calls, json!([{"id": 1}])))
        .await;
    cache
        .ensure_fresh(
            &by_status_key,
            counted_fetcher(&by_status_calls, json!({"open": 1})),
        )
        .await;
    cache
        .ensure_fresh(
            &projects_key,
            counted_fetcher(&projects_calls, json!([{"id": 9}])),
        )
        .await;

    // Live watchers make the invalidation refetch instead of just staling.
    let _watch_tasks = cache.watch(&tasks_key);
    let _watch_by_status = cache.watch(&by_status_key);
    let _watch_projects = cache.watch(&projects_key);

    state.push(TableId::Tasks, ChangeKind::Delete);

    wait_until("tasks keys refetched", || {
        tasks_calls.load(Ordering::SeqCst) == 2 && by_status_calls.load(Ordering::SeqCst) == 2
    })
    .await;
    wait_until("tasks keys fresh again", || {
        cache.read(&tasks_key).status == EntryStatus::Fresh
            && cache.read(&by_status_key).status == EntryStatus::Fresh
    })
    .await;

    // Feature B saw no change at all.
    assert_eq!(projects_calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.read(&projects_key).status, EntryStatus::Fresh);

    runtime.shutdown().await;
}

/// Two features share `invoices`; the wire subscription survives the first
/// unregister and disappears with the second.
#[tokio::test]
async fn shared_table_unsubscribes_with_last_handle() {
    let (state, transport) = ScriptedTransport::new();
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;

    let a = runtime
        .registry()
        .register(tables(&[TableId::Invoices]), vec![])
        .await;
    let b = runtime
        .registry()
        .register(tables(&[TableId::Invoices]), vec![])
        .await;
    wait_until("invoices subscribed", || {
        state.subscribed().contains(TableId::Invoices)
    })
    .await;

    runtime.registry().unregister(a).await;
    // The set is unchanged, so nothing should be pushed to the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.subscribed().contains(TableId::Invoices));

    runtime.registry().unregister(b).await;
    wait_until("invoices unsubscribed", || {
        !state.subscribed().contains(TableId::Invoices)
    })
    .await;

    runtime.shutdown().await;
}

/// Connection attempts fail twice, then succeed; after a later stream drop
/// the channel reconnects and re-issues the full desired set, and events
/// flow again.
#[tokio::test]
async fn reconnect_restores_subscription_and_delivery() {
    let (state, transport) = ScriptedTransport::failing_first(2);
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;
    let cache = runtime.cache();

    // The first explicit attempt fails; the channel keeps retrying.
    assert!(runtime.connect().await.is_err());

    let _feature = runtime
        .registry()
        .register(tables(&[TableId::Tasks]), vec![])
        .await;
    wait_until("initial connection", || {
        state.connects() == 1 && state.subscribed().contains(TableId::Tasks)
    })
    .await;
    assert!(runtime.is_connected());

    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::table(TableId::Tasks);
    cache
        .ensure_fresh(&key, counted_fetcher(&calls, json!([])))
        .await;

    state.push(TableId::Tasks, ChangeKind::Update);
    wait_until("event before drop invalidates", || {
        cache.read(&key).status == EntryStatus::Stale
    })
    .await;

    state.drop_connection();
    wait_until("reconnection with full desired set", || {
        state.connects() == 2 && state.subscribed().contains(TableId::Tasks)
    })
    .await;

    cache
        .ensure_fresh(&key, counted_fetcher(&calls, json!([])))
        .await;
    state.push(TableId::Tasks, ChangeKind::Insert);
    wait_until("event after reconnect invalidates", || {
        cache.read(&key).status == EntryStatus::Stale
    })
    .await;

    runtime.shutdown().await;
}

/// A mutation's local trigger invalidates direct and aggregate keys without
/// any transport round-trip.
#[tokio::test]
async fn local_write_trigger_invalidates_without_transport() {
    let (_state, transport) = ScriptedTransport::new();
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;
    let cache = runtime.cache();

    let invoices_key = CacheKey::table(TableId::Invoices).text("unpaid");
    let dashboard_key = CacheKey::view(DerivedView::DashboardStats);
    let calls = Arc::new(AtomicUsize::new(0));
    cache
        .ensure_fresh(&invoices_key, counted_fetcher(&calls, json!([])))
        .await;
    cache
        .ensure_fresh(&dashboard_key, counted_fetcher(&calls, json!({})))
        .await;

    runtime.trigger().updated(TableId::Invoices);

    wait_until("local trigger stales invoices and dashboard", || {
        cache.read(&invoices_key).status == EntryStatus::Stale
            && cache.read(&dashboard_key).status == EntryStatus::Stale
    })
    .await;

    runtime.shutdown().await;
}

/// The local and remote invalidation paths may both fire for one write;
/// the cache converges fresh with a bounded number of fetches.
#[tokio::test]
async fn dual_invalidation_paths_converge() {
    let (state, transport) = ScriptedTransport::new();
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;
    let cache = runtime.cache();

    let _feature = runtime
        .registry()
        .register(tables(&[TableId::Clients]), vec![])
        .await;
    wait_until("clients subscribed", || {
        state.subscribed().contains(TableId::Clients)
    })
    .await;

    let key = CacheKey::table(TableId::Clients);
    let calls = Arc::new(AtomicUsize::new(0));
    cache
        .ensure_fresh(&key, counted_fetcher(&calls, json!([{"id": 3}])))
        .await;
    let _watch = cache.watch(&key);

    // Both paths fire for the same write.
    runtime.trigger().updated(TableId::Clients);
    state.push(TableId::Clients, ChangeKind::Update);

    wait_until("cache converges fresh", || {
        cache.read(&key).status == EntryStatus::Fresh && calls.load(Ordering::SeqCst) >= 2
    })
    .await;
    // One initial fetch plus at most one refetch per delivered event.
    assert!(calls.load(Ordering::SeqCst) <= 3);

    runtime.shutdown().await;
}

/// Listeners registered on the channel observe events in arrival order.
#[tokio::test]
async fn channel_listeners_see_fifo_order() {
    let (state, transport) = ScriptedTransport::new();
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;

    let mut events = runtime.channel().events().await;
    let _feature = runtime
        .registry()
        .register(tables(&[TableId::Tasks, TableId::Projects]), vec![])
        .await;
    wait_until("tables subscribed", || {
        state.subscribed().contains(TableId::Tasks)
    })
    .await;

    state.push(TableId::Tasks, ChangeKind::Insert);
    state.push(TableId::Projects, ChangeKind::Update);
    state.push(TableId::Tasks, ChangeKind::Delete);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("channel alive");
        seen.push((event.table, event.kind));
    }
    assert_eq!(
        seen,
        vec![
            (TableId::Tasks, ChangeKind::Insert),
            (TableId::Projects, ChangeKind::Update),
            (TableId::Tasks, ChangeKind::Delete),
        ]
    );
    // Epochs were stamped in arrival order as well.
    runtime.shutdown().await;
}

/// A fetch failure after invalidation keeps the previous value on screen;
/// the next freshness request recovers.
#[tokio::test]
async fn errored_entries_keep_serving_stale_values() {
    let (_state, transport) = ScriptedTransport::new();
    let runtime: SyncRuntime<Value> = SyncRuntime::start(fast_settings(), transport).await;
    let cache = runtime.cache();

    let key = CacheKey::table(TableId::Projects);
    let calls = Arc::new(AtomicUsize::new(0));
    cache
        .ensure_fresh(&key, counted_fetcher(&calls, json!({"name": "alpha"})))
        .await;

    cache.invalidate(&KeyPattern::table(TableId::Projects));
    let snapshot = cache
        .ensure_fresh(&key, || {
            Box::pin(async {
                Err::<Value, _>(FetchError::transient("store unreachable"))
            })
        })
        .await;

    assert_eq!(snapshot.status, EntryStatus::Errored);
    assert_eq!(snapshot.value, Some(json!({"name": "alpha"})));

    let recovered = cache
        .ensure_fresh(&key, counted_fetcher(&calls, json!({"name": "beta"})))
        .await;
    assert_eq!(recovered.status, EntryStatus::Fresh);
    assert_eq!(recovered.value, Some(json!({"name": "beta"})));

    runtime.shutdown().await;
}
