//! Coordination between execution contexts that share one Local Store.
//!
//! Each context announces its local writes in the shared store. When a pulled
//! snapshot of a row is no newer than a recent announcement plus a grace
//! window, the pull is assumed to echo a write that has not round-tripped yet
//! and is suppressed so it cannot overwrite the fresher local value.

use tracing::trace;

use tidepool_core::{ContextId, Row, RowId};
use tidepool_storage::{Store, StoreTx};

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct ContextCoordinator {
    context_id: ContextId,
    grace_ms: u64,
}

impl ContextCoordinator {
    pub fn new(grace_ms: u64) -> Self {
        Self {
            context_id: ContextId::new(),
            grace_ms,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn grace_ms(&self) -> u64 {
        self.grace_ms
    }

    pub(crate) fn announce(
        &self,
        tx: &mut StoreTx<'_>,
        table: &str,
        id: RowId,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        tx.announce_write(table, id, self.context_id, now_ms)?;
        Ok(())
    }

    /// Whether a pulled snapshot should be ignored in favour of a recent local write.
    ///
    /// Remote tombstones are never suppressed.
    pub fn should_suppress<S: Store + ?Sized>(&self, store: &S, remote: &Row) -> Result<bool, EngineError> {
        if remote.deleted {
            return Ok(false);
        }
        let Some(write) = store.local_write(&remote.table, remote.id)? else {
            return Ok(false);
        };
        let suppress = remote.updated_at.wall_ms() <= write.written_ms.saturating_add(self.grace_ms);
        if suppress {
            trace!(
                row = %remote.id,
                writer = %write.context_id,
                own = write.context_id == self.context_id,
                "suppressing pulled snapshot behind a recent local write"
            );
        }
        Ok(suppress)
    }

    /// Forget announcements older than the grace window whose writes have drained.
    pub(crate) fn prune(&self, tx: &mut StoreTx<'_>, now_ms: u64) -> Result<usize, EngineError> {
        Ok(tx.prune_local_writes(now_ms.saturating_sub(self.grace_ms))?)
    }
}
