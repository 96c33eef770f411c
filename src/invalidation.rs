//! Static mapping from a changed table to the cache key patterns it
//! invalidates.
//!
//! Two kinds of rows: every table invalidates its own root (all cached
//! list/detail/filtered views under it), and a manually curated set of
//! cross-table rows keeps derived aggregate views honest. The aggregate
//! list is intentionally not inferred: it is the documented extension
//! point for new derived views, and the exhaustive match below turns a
//! forgotten decision for a *new table* into a compile error.

use crate::keys::{DerivedView, KeyPattern};
use crate::tables::TableId;

/// Key patterns invalidated by a change to `table`.
pub fn affected_patterns(table: TableId) -> Vec<KeyPattern> {
    let mut patterns = vec![KeyPattern::table(table)];

    match table {
        TableId::Projects | TableId::Clients | TableId::Tasks | TableId::Invoices => {
            patterns.push(KeyPattern::view(DerivedView::DashboardStats));
            patterns.push(KeyPattern::view(DerivedView::RecentItems));
        }
        TableId::TimeEntries => {
            patterns.push(KeyPattern::view(DerivedView::DashboardStats));
            patterns.push(KeyPattern::view(DerivedView::RunningTimer));
        }
        TableId::Settings => {}
    }

    patterns
}
