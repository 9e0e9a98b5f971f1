//! Order allocation for draggable lists.
//!
//! New positions are derived from the current live bounds of the sibling
//! scope so siblings are never renumbered. Two replicas prepending into the
//! same scope while offline can still pick the same value; reads break such
//! ties by id.

use tidepool_core::{FieldValue, Placement};
use tidepool_storage::Store;

use crate::error::EngineError;

/// Order for a new row given the live `(min, max)` of its scope.
pub fn allocate(bounds: Option<(i64, i64)>, placement: Placement) -> i64 {
    match (bounds, placement) {
        (None, _) => 0,
        (Some((min, _)), Placement::Prepend) => min.saturating_sub(1),
        (Some((_, max)), Placement::Append) => max.saturating_add(1),
    }
}

pub(crate) fn next_order<S: Store + ?Sized>(
    store: &S,
    table: &str,
    scope: Option<(&str, &FieldValue)>,
    placement: Placement,
) -> Result<i64, EngineError> {
    Ok(allocate(store.order_bounds(table, scope)?, placement))
}
