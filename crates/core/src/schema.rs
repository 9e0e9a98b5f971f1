use std::fmt::Debug;
use std::hash::Hash;

/// What happens to child rows when their parent is soft-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// The child becomes a tombstone too, and so do its own descendants.
    Cascade,
    /// The child survives with its foreign key set to `Null`.
    Unlink,
}

/// A static parent -> child foreign-key relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship<K> {
    pub parent: K,
    pub child: K,
    /// Field on the child holding `Ref(parent_id)`.
    pub foreign_key: &'static str,
    pub on_delete: OnDelete,
}

impl<K> Relationship<K> {
    pub const fn cascade(parent: K, child: K, foreign_key: &'static str) -> Self {
        Self {
            parent,
            child,
            foreign_key,
            on_delete: OnDelete::Cascade,
        }
    }

    pub const fn unlink(parent: K, child: K, foreign_key: &'static str) -> Self {
        Self {
            parent,
            child,
            foreign_key,
            on_delete: OnDelete::Unlink,
        }
    }
}

/// Where a newly created row lands among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Prepend,
    Append,
}

/// The sibling scope of a draggable table: rows sharing `scope_field` are siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderScope {
    pub scope_field: &'static str,
    pub placement: Placement,
}

/// A closed set of entity kinds supplied by domain code.
///
/// Implemented by a fieldless enum so that table names and the relationship
/// table are checked at compile time instead of being matched as strings.
pub trait EntityKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn all() -> &'static [Self];

    fn relationships() -> &'static [Relationship<Self>];

    fn order_scope(&self) -> Option<OrderScope> {
        None
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.name() == name)
    }

    /// Relationships in which `self` is the parent.
    fn children(&self) -> Vec<Relationship<Self>> {
        Self::relationships()
            .iter()
            .filter(|r| r.parent == *self)
            .copied()
            .collect()
    }
}
