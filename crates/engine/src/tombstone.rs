//! Soft-delete cascades over the static relationship table.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use tidepool_core::{EntityKind, FieldValue, OnDelete, RowId};
use tidepool_storage::Store;

use crate::error::EngineError;

/// Every row a soft delete touches, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePlan<K> {
    /// Rows to tombstone, starting with the root.
    pub deletes: Vec<(K, RowId)>,
    /// Surviving rows whose foreign key must be cleared.
    pub unlinks: Vec<(K, RowId, &'static str)>,
}

impl<K> CascadePlan<K> {
    pub fn len(&self) -> usize {
        self.deletes.len() + self.unlinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.unlinks.is_empty()
    }
}

/// Walk live descendants of `(kind, id)` breadth first.
///
/// Each row is visited once, so reference cycles terminate. A row reached
/// both through a cascade and an unlink is deleted, not unlinked.
pub fn discover<K: EntityKind, S: Store + ?Sized>(
    store: &S,
    kind: K,
    id: RowId,
) -> Result<CascadePlan<K>, EngineError> {
    let mut visited = HashSet::from([id]);
    let mut queue = VecDeque::from([(kind, id)]);
    let mut plan = CascadePlan {
        deletes: vec![(kind, id)],
        unlinks: Vec::new(),
    };

    while let Some((parent_kind, parent_id)) = queue.pop_front() {
        let key = FieldValue::Ref(parent_id);
        for rel in parent_kind.children() {
            let children = store.query_rows(rel.child.name(), rel.foreign_key, &key, false)?;
            for child in children {
                match rel.on_delete {
                    OnDelete::Cascade => {
                        if visited.insert(child.id) {
                            plan.deletes.push((rel.child, child.id));
                            queue.push_back((rel.child, child.id));
                        }
                    }
                    OnDelete::Unlink => plan.unlinks.push((rel.child, child.id, rel.foreign_key)),
                }
            }
        }
    }

    plan.unlinks.retain(|(_, id, _)| !visited.contains(id));
    debug!(
        root = %id,
        deletes = plan.deletes.len(),
        unlinks = plan.unlinks.len(),
        "planned cascade"
    );
    Ok(plan)
}
