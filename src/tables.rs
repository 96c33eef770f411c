//! Closed universe of remote tables.
//!
//! Table references are a compile-time concern: the remote store's logical
//! collections are finite and known at build time, so they are modeled as an
//! enumeration rather than free strings.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a logical collection in the remote store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TableId {
    Projects,
    Clients,
    Tasks,
    Invoices,
    TimeEntries,
    Settings,
}

impl TableId {
    /// Every table, in declaration order. Useful for exhaustive sweeps in
    /// tests and diagnostics.
    pub const ALL: [TableId; 6] = [
        TableId::Projects,
        TableId::Clients,
        TableId::Tasks,
        TableId::Invoices,
        TableId::TimeEntries,
        TableId::Settings,
    ];

    /// Wire name of the table, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableId::Projects => "projects",
            TableId::Clients => "clients",
            TableId::Tasks => "tasks",
            TableId::Invoices => "invoices",
            TableId::TimeEntries => "time-entries",
            TableId::Settings => "settings",
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unordered set of tables.
///
/// Used both for per-feature interest declarations and for the desired-set
/// reconciliation between the registry and the change-event channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet(BTreeSet<TableId>);

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: TableId) -> bool {
        self.0.insert(table)
    }

    pub fn remove(&mut self, table: TableId) -> bool {
        self.0.remove(&table)
    }

    pub fn contains(&self, table: TableId) -> bool {
        self.0.contains(&table)
    }

    pub fn extend(&mut self, other: &TableSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// Tables present in `self` but not in `other`.
    pub fn difference(&self, other: &TableSet) -> TableSet {
        TableSet(self.0.difference(&other.0).copied().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = TableId> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<TableId> for TableSet {
    fn from_iter<I: IntoIterator<Item = TableId>>(iter: I) -> Self {
        TableSet(iter.into_iter().collect())
    }
}

impl fmt::Display for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for table in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(table.as_str())?;
        }
        Ok(())
    }
}
