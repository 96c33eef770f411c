//! Per-feature interest declarations.
//!
//! Features declare the tables (and supplementary cache keys) they care
//! about when they mount and withdraw the declaration when they unmount.
//! The registry composes all live declarations into the single active table
//! set the change-event channel subscribes to: a table stays desired until
//! the last referencing handle is unregistered.
//!
//! The registry is an explicit, injected instance rather than ambient
//! global state, so teardown is deterministic and tests need no UI
//! runtime.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use tracing::{debug, warn};

use crate::channel::ChangeEventChannel;
use crate::keys::CacheKey;
use crate::lock::{rw_read, rw_write};
use crate::tables::{TableId, TableSet};

const SOURCE: &str = "registry";

const METRIC_ACTIVE_TABLES: &str = "marea_active_tables";

struct InterestEntry {
    tables: TableSet,
    extra_keys: Vec<CacheKey>,
}

/// Proof of one feature's live interest declaration.
///
/// Consumed by [`SubscriptionRegistry::unregister`]; passing it by value
/// makes double-teardown unrepresentable. A handle dropped without
/// unregistering keeps its tables desired; debug builds log the leak.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    tables: TableSet,
    extra_keys: Vec<CacheKey>,
    released: bool,
}

impl SubscriptionHandle {
    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn extra_keys(&self) -> &[CacheKey] {
        &self.extra_keys
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.released && cfg!(debug_assertions) {
            warn!(
                handle_id = self.id,
                tables = %self.tables,
                "Subscription handle dropped without unregister; its tables stay desired"
            );
        }
    }
}

/// Composes per-feature interest into the channel's desired table set.
pub struct SubscriptionRegistry {
    channel: Option<ChangeEventChannel>,
    entries: RwLock<HashMap<u64, InterestEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(channel: ChangeEventChannel) -> Self {
        Self {
            channel: Some(channel),
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registry with no channel attached; interest is tracked but nothing
    /// is pushed anywhere. Test seam.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            channel: None,
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Declare interest in `tables`, plus feature-specific `extra_keys`
    /// invalidated alongside the static map whenever one of those tables
    /// changes.
    pub async fn register(
        &self,
        tables: TableSet,
        extra_keys: Vec<CacheKey>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let before = self.active_tables();
        {
            let mut entries = rw_write(&self.entries, SOURCE, "register");
            entries.insert(
                id,
                InterestEntry {
                    tables: tables.clone(),
                    extra_keys: extra_keys.clone(),
                },
            );
        }
        debug!(handle_id = id, tables = %tables, "Subscription registered");
        self.push_if_changed(before).await;

        SubscriptionHandle {
            id,
            tables,
            extra_keys,
            released: false,
        }
    }

    /// Withdraw a declaration. Tables still referenced by other handles
    /// stay desired; the rest leave the channel's subscription.
    pub async fn unregister(&self, mut handle: SubscriptionHandle) {
        handle.released = true;
        let before = self.active_tables();
        let removed = {
            let mut entries = rw_write(&self.entries, SOURCE, "unregister");
            entries.remove(&handle.id).is_some()
        };
        if !removed {
            warn!(handle_id = handle.id, "Unregister for unknown subscription handle");
            return;
        }
        debug!(handle_id = handle.id, tables = %handle.tables, "Subscription unregistered");
        self.push_if_changed(before).await;
    }

    /// Union of tables across all live handles. Derived, never stored.
    pub fn active_tables(&self) -> TableSet {
        let entries = rw_read(&self.entries, SOURCE, "active_tables");
        let mut union = TableSet::new();
        for entry in entries.values() {
            union.extend(&entry.tables);
        }
        union
    }

    /// Supplementary keys declared by handles interested in `table`,
    /// deduplicated, in registration order.
    pub fn extra_keys_for(&self, table: TableId) -> Vec<CacheKey> {
        let entries = rw_read(&self.entries, SOURCE, "extra_keys_for");
        let mut ids: Vec<_> = entries
            .iter()
            .filter(|(_, entry)| entry.tables.contains(table))
            .collect();
        ids.sort_by_key(|(id, _)| **id);

        let mut keys: Vec<CacheKey> = Vec::new();
        for (_, entry) in ids {
            for key in &entry.extra_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    pub fn handle_count(&self) -> usize {
        rw_read(&self.entries, SOURCE, "handle_count").len()
    }

    async fn push_if_changed(&self, before: TableSet) {
        let now = self.active_tables();
        if now == before {
            return;
        }
        gauge!(METRIC_ACTIVE_TABLES).set(now.len() as f64);
        if let Some(channel) = &self.channel {
            channel.set_desired_tables(now).await;
        }
    }
}
