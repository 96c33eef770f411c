//! Cache key definitions.
//!
//! A [`CacheKey`] identifies one cached query result: a mandatory root (the
//! table or derived view the result comes from) plus ordered scalar
//! components. A [`KeyPattern`] matches keys by root equality and
//! component-prefix equality, which is how "invalidate every cached view
//! derived from this table" is expressed without enumerating concrete keys.

use std::fmt;

use uuid::Uuid;

use crate::tables::TableId;

/// Opaque principal identity supplied by the session layer.
///
/// Only ever used as a key component to scope per-user queries (for example
/// the running-timer view); the sync layer attaches no meaning to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Manually curated aggregate views derived from more than one table.
///
/// Extension point: adding a view means adding a variant here and deciding
/// its row in [`crate::invalidation::affected_patterns`]. The compiler
/// enforces the second step via the exhaustive match over [`TableId`], but
/// view membership itself stays a deliberate, reviewed edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DerivedView {
    DashboardStats,
    RecentItems,
    RunningTimer,
}

impl DerivedView {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedView::DashboardStats => "dashboard-stats",
            DerivedView::RecentItems => "recent-items",
            DerivedView::RunningTimer => "running-timer",
        }
    }
}

/// First component of every cache key: a table or a derived view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyRoot {
    Table(TableId),
    View(DerivedView),
}

impl fmt::Display for KeyRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRoot::Table(table) => f.write_str(table.as_str()),
            KeyRoot::View(view) => f.write_str(view.as_str()),
        }
    }
}

/// Scalar key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Text(String),
    Id(Uuid),
    Int(i64),
    Principal(PrincipalId),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Text(text) => f.write_str(text),
            KeyPart::Id(id) => write!(f, "{id}"),
            KeyPart::Int(n) => write!(f, "{n}"),
            KeyPart::Principal(principal) => f.write_str(principal.as_str()),
        }
    }
}

/// Identifier of one cached query result.
///
/// Two keys are equal iff root and component sequences are equal; the cache
/// holds at most one entry per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    root: KeyRoot,
    parts: Vec<KeyPart>,
}

impl CacheKey {
    /// Canonical key of a table's primary list view.
    pub fn table(table: TableId) -> Self {
        Self {
            root: KeyRoot::Table(table),
            parts: Vec::new(),
        }
    }

    /// Key of a derived aggregate view.
    pub fn view(view: DerivedView) -> Self {
        Self {
            root: KeyRoot::View(view),
            parts: Vec::new(),
        }
    }

    /// Append a component, builder style.
    pub fn part(mut self, part: KeyPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.part(KeyPart::Text(text.into()))
    }

    pub fn id(self, id: Uuid) -> Self {
        self.part(KeyPart::Id(id))
    }

    pub fn principal(self, principal: PrincipalId) -> Self {
        self.part(KeyPart::Principal(principal))
    }

    pub fn root(&self) -> KeyRoot {
        self.root
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for part in &self.parts {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

/// Prefix pattern over cache keys.
///
/// Matches a key when the roots are equal and the pattern's components are a
/// prefix of the key's components. A bare-root pattern therefore matches
/// every key under that root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    root: KeyRoot,
    parts: Vec<KeyPart>,
}

impl KeyPattern {
    /// Everything cached under a table.
    pub fn table(table: TableId) -> Self {
        Self {
            root: KeyRoot::Table(table),
            parts: Vec::new(),
        }
    }

    /// Everything cached under a derived view.
    pub fn view(view: DerivedView) -> Self {
        Self {
            root: KeyRoot::View(view),
            parts: Vec::new(),
        }
    }

    /// Pattern with exactly the given key's components: matches that key and
    /// any key extending it.
    pub fn of(key: &CacheKey) -> Self {
        Self {
            root: key.root,
            parts: key.parts.clone(),
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        self.root == key.root && key.parts.starts_with(&self.parts)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for part in &self.parts {
            write!(f, "/{part}")?;
        }
        f.write_str("/*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_equality_is_component_equality() {
        let a = CacheKey::table(TableId::Tasks).text("by-status");
        let b = CacheKey::table(TableId::Tasks).text("by-status");
        let c = CacheKey::table(TableId::Tasks).text("by-project");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, CacheKey::table(TableId::Tasks));
    }

    #[test]
    fn bare_root_pattern_matches_all_suffixes() {
        let pattern = KeyPattern::table(TableId::Tasks);
        let project = Uuid::new_v4();

        assert!(pattern.matches(&CacheKey::table(TableId::Tasks)));
        assert!(pattern.matches(&CacheKey::table(TableId::Tasks).id(project)));
        assert!(pattern.matches(&CacheKey::table(TableId::Tasks).text("by-status")));
        assert!(!pattern.matches(&CacheKey::table(TableId::Projects)));
        assert!(!pattern.matches(&CacheKey::view(DerivedView::RecentItems)));
    }

    #[test]
    fn prefix_pattern_respects_component_order() {
        let project = Uuid::new_v4();
        let pattern = KeyPattern::of(&CacheKey::table(TableId::Tasks).id(project));

        assert!(pattern.matches(&CacheKey::table(TableId::Tasks).id(project)));
        assert!(pattern.matches(&CacheKey::table(TableId::Tasks).id(project).text("open")));
        assert!(!pattern.matches(&CacheKey::table(TableId::Tasks)));
        assert!(!pattern.matches(&CacheKey::table(TableId::Tasks).id(Uuid::new_v4())));
    }

    #[test]
    fn principal_scoped_keys_stay_distinct() {
        let mine = CacheKey::view(DerivedView::RunningTimer)
            .principal(PrincipalId::new("user-a"));
        let theirs = CacheKey::view(DerivedView::RunningTimer)
            .principal(PrincipalId::new("user-b"));

        assert_ne!(mine, theirs);
        // A bare view pattern still sweeps both.
        assert!(KeyPattern::view(DerivedView::RunningTimer).matches(&mine));
        assert!(KeyPattern::view(DerivedView::RunningTimer).matches(&theirs));
    }

    #[test]
    fn display_renders_path_form() {
        let key = CacheKey::table(TableId::Invoices).text("unpaid");
        assert_eq!(key.to_string(), "invoices/unpaid");
        assert_eq!(KeyPattern::table(TableId::Invoices).to_string(), "invoices/*");
    }
}
