//! Stale-while-revalidate query cache.
//!
//! One entry per [`CacheKey`]; entries hold the last known value alongside a
//! freshness status, so invalidation never blanks data that is currently on
//! screen; stale values stay readable until the replacement lands.
//!
//! The coalescing invariant is enforced here explicitly: a fetch only starts
//! after a status check-and-set under the entry lock, so concurrent
//! freshness requests for the same key join the in-flight fetch instead of
//! duplicating it. Locks are never held across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::SyncSettings;
use crate::error::FetchError;
use crate::keys::{CacheKey, KeyPattern};
use crate::lock::mutex_lock;

const SOURCE: &str = "store";

const METRIC_FETCH_COALESCED: &str = "marea_fetch_coalesced_total";
const METRIC_FETCH_ERRORS: &str = "marea_fetch_errors_total";
const METRIC_INVALIDATED_ENTRIES: &str = "marea_invalidated_entries_total";
const METRIC_REFETCH_SPAWNED: &str = "marea_refetch_spawned_total";
const METRIC_FETCH_MS: &str = "marea_fetch_ms";

/// Fetch recipe registered per key: side-effect-free async function
/// returning the key's current value from the authoritative source.
pub type Fetcher<V> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<V, FetchError>> + Send + Sync>;

/// Freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Fresh,
    Stale,
    Fetching,
    Errored,
}

/// Cloned public view of one entry, returned by reads and pushed to
/// watchers on every transition.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<V> {
    pub key: CacheKey,
    pub value: Option<V>,
    pub status: EntryStatus,
    pub last_updated: Option<OffsetDateTime>,
    pub error: Option<String>,
}

struct Entry<V> {
    value: Option<V>,
    status: EntryStatus,
    last_updated: Option<OffsetDateTime>,
    error: Option<String>,
    fetcher: Option<Fetcher<V>>,
    /// Completion signal of the in-flight fetch; present iff status is
    /// `Fetching`. Joiners clone the receiver and wait for `true`.
    in_flight: Option<watch::Receiver<bool>>,
    watchers: Vec<(u64, mpsc::UnboundedSender<EntrySnapshot<V>>)>,
}

impl<V> Entry<V> {
    fn new() -> Self {
        Self {
            value: None,
            status: EntryStatus::Stale,
            last_updated: None,
            error: None,
            fetcher: None,
            in_flight: None,
            watchers: Vec::new(),
        }
    }
}

impl<V: Clone> Entry<V> {
    fn snapshot(&self, key: &CacheKey) -> EntrySnapshot<V> {
        EntrySnapshot {
            key: key.clone(),
            value: self.value.clone(),
            status: self.status,
            last_updated: self.last_updated,
            error: self.error.clone(),
        }
    }

    fn notify(&mut self, key: &CacheKey) {
        let snapshot = self.snapshot(key);
        self.watchers
            .retain(|(_, tx)| tx.send(snapshot.clone()).is_ok());
    }

    /// Transition to `Fetching` and install a fresh completion signal.
    /// Returns the sender the fetch must complete with.
    fn begin_fetch(&mut self, key: &CacheKey) -> watch::Sender<bool> {
        let (done_tx, done_rx) = watch::channel(false);
        self.status = EntryStatus::Fetching;
        self.in_flight = Some(done_rx);
        self.notify(key);
        done_tx
    }
}

enum Plan<V> {
    Done(EntrySnapshot<V>),
    Join(watch::Receiver<bool>),
    Fetch(watch::Sender<bool>),
}

/// Generic cache keyed by [`CacheKey`] with per-entry staleness, fetch
/// coalescing, and watcher notification.
///
/// Constructed directly into an `Arc`: background refetches and watch
/// handles need a weak self-reference.
pub struct QueryCache<V> {
    entries: Mutex<HashMap<CacheKey, Entry<V>>>,
    refetch_watched: bool,
    watcher_ids: AtomicU64,
    self_ref: Weak<QueryCache<V>>,
}

impl<V> QueryCache<V> {
    pub fn new(settings: &SyncSettings) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            entries: Mutex::new(HashMap::new()),
            refetch_watched: settings.refetch_watched,
            watcher_ids: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.entries, SOURCE, "contains").contains_key(key)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live watchers on a key.
    pub fn watcher_count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.entries, SOURCE, "watcher_count")
            .get(key)
            .map_or(0, |entry| entry.watchers.len())
    }

    fn remove_watcher(&self, key: &CacheKey, id: u64) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "remove_watcher");
        if let Some(entry) = entries.get_mut(key) {
            entry.watchers.retain(|(watcher_id, _)| *watcher_id != id);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    /// Current state of a key, immediately and without blocking.
    ///
    /// A key that has never been cached reads as stale-and-empty.
    pub fn read(&self, key: &CacheKey) -> EntrySnapshot<V> {
        let entries = mutex_lock(&self.entries, SOURCE, "read");
        match entries.get(key) {
            Some(entry) => entry.snapshot(key),
            None => EntrySnapshot {
                key: key.clone(),
                value: None,
                status: EntryStatus::Stale,
                last_updated: None,
                error: None,
            },
        }
    }

    /// Ensure the entry is fresh, fetching at most once across concurrent
    /// callers.
    ///
    /// A `Fresh` entry returns immediately. Otherwise the entry transitions
    /// to `Fetching` and the fetcher runs exactly once; concurrent callers
    /// for the same key await the same completion signal. The fetcher is
    /// retained on the entry so invalidation-triggered refetches reuse it.
    ///
    /// On success the entry becomes `Fresh` with the new value; on failure
    /// it becomes `Errored`, the previous value stays readable, and the
    /// next call retries.
    pub async fn ensure_fresh<F, Fut>(&self, key: &CacheKey, fetcher: F) -> EntrySnapshot<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let recipe: Fetcher<V> = Arc::new(move || Box::pin(fetcher()));
        loop {
            let plan = {
                let mut entries = mutex_lock(&self.entries, SOURCE, "ensure_fresh");
                let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
                entry.fetcher = Some(recipe.clone());
                match entry.status {
                    EntryStatus::Fresh => Plan::Done(entry.snapshot(key)),
                    EntryStatus::Fetching => match entry.in_flight.clone() {
                        Some(done_rx) => Plan::Join(done_rx),
                        // Signal lost with the fetch task; restart.
                        None => Plan::Fetch(entry.begin_fetch(key)),
                    },
                    EntryStatus::Stale | EntryStatus::Errored => {
                        Plan::Fetch(entry.begin_fetch(key))
                    }
                }
            };

            match plan {
                Plan::Done(snapshot) => return snapshot,
                Plan::Join(mut done_rx) => {
                    counter!(METRIC_FETCH_COALESCED).increment(1);
                    match done_rx.wait_for(|done| *done).await {
                        Ok(_) => return self.read(key),
                        // The fetching task dropped its sender without
                        // completing; take another turn.
                        Err(_) => continue,
                    }
                }
                Plan::Fetch(done_tx) => return self.run_fetch(key, recipe, done_tx).await,
            }
        }
    }

    /// Mark every entry matching `pattern` stale, keeping values visible,
    /// and refetch the ones somebody is still watching.
    ///
    /// Entries currently `Fetching` are left alone: the in-flight result
    /// will land and a later event re-stales them if needed. Idempotent:
    /// re-invalidating a stale entry changes nothing beyond the (coalesced)
    /// refetch. Returns the number of matching entries now stale.
    pub fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let mut touched = 0;
        let mut refetch_keys = Vec::new();
        {
            let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate");
            for (key, entry) in entries.iter_mut() {
                if !pattern.matches(key) {
                    continue;
                }
                match entry.status {
                    EntryStatus::Fetching => continue,
                    EntryStatus::Fresh | EntryStatus::Errored => {
                        entry.status = EntryStatus::Stale;
                        entry.notify(key);
                        touched += 1;
                    }
                    EntryStatus::Stale => {
                        touched += 1;
                    }
                }
                if self.refetch_watched
                    && !entry.watchers.is_empty()
                    && entry.fetcher.is_some()
                {
                    refetch_keys.push(key.clone());
                }
            }
        }

        if touched > 0 {
            counter!(METRIC_INVALIDATED_ENTRIES).increment(touched as u64);
        }
        debug!(pattern = %pattern, touched, refetching = refetch_keys.len(), "Invalidated");

        for key in refetch_keys {
            let Some(cache) = self.self_ref.upgrade() else {
                break;
            };
            counter!(METRIC_REFETCH_SPAWNED).increment(1);
            tokio::spawn(async move {
                cache.refetch(key).await;
            });
        }

        touched
    }

    /// Register a watcher notified on every status or value transition of
    /// the key. Dropping the returned [`KeyWatch`] unregisters it.
    pub fn watch(&self, key: &CacheKey) -> KeyWatch<V> {
        let id = self.watcher_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut entries = mutex_lock(&self.entries, SOURCE, "watch");
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.watchers.push((id, tx));
        }
        KeyWatch {
            key: key.clone(),
            id,
            rx,
            cache: self.self_ref.clone(),
        }
    }

    /// Background refetch after invalidation. Re-checks the entry under the
    /// lock so a racing `ensure_fresh` wins and this becomes a no-op.
    async fn refetch(&self, key: CacheKey) {
        let started = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "refetch");
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            if !matches!(entry.status, EntryStatus::Stale | EntryStatus::Errored) {
                return;
            }
            if entry.watchers.is_empty() {
                return;
            }
            let Some(recipe) = entry.fetcher.clone() else {
                return;
            };
            let done_tx = entry.begin_fetch(&key);
            (recipe, done_tx)
        };
        let (recipe, done_tx) = started;
        self.run_fetch(&key, recipe, done_tx).await;
    }

    async fn run_fetch(
        &self,
        key: &CacheKey,
        recipe: Fetcher<V>,
        done_tx: watch::Sender<bool>,
    ) -> EntrySnapshot<V> {
        let started_at = Instant::now();
        let result = (recipe)().await;

        let snapshot = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "run_fetch");
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            match result {
                Ok(value) => {
                    entry.value = Some(value);
                    entry.status = EntryStatus::Fresh;
                    entry.last_updated = Some(OffsetDateTime::now_utc());
                    entry.error = None;
                }
                Err(err) => {
                    counter!(METRIC_FETCH_ERRORS).increment(1);
                    warn!(
                        key = %key,
                        error = %err,
                        transient = err.is_transient(),
                        "Fetch failed; previous value retained"
                    );
                    entry.status = EntryStatus::Errored;
                    entry.error = Some(err.to_string());
                }
            }
            entry.in_flight = None;
            entry.notify(key);
            entry.snapshot(key)
        };

        histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        let _ = done_tx.send(true);
        snapshot
    }
}

/// Live watcher of one key. Dropping it unregisters the listener.
pub struct KeyWatch<V> {
    key: CacheKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<EntrySnapshot<V>>,
    cache: Weak<QueryCache<V>>,
}

impl<V> KeyWatch<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Next transition of the watched key. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<EntrySnapshot<V>> {
        self.rx.recv().await
    }
}

impl<V> Drop for KeyWatch<V> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.remove_watcher(&self.key, self.id);
        }
    }
}
