pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod order;
pub mod outbox;
pub mod remote;
pub mod resolver;
pub mod scheduler;
mod sync;
pub mod tombstone;

pub use batch::{BatchKind, BatchOp};
pub use config::EngineConfig;
pub use coordinator::ContextCoordinator;
pub use error::EngineError;
pub use events::{ChangeEvent, ChangeKind, ChangeOrigin, EventBus};
pub use remote::{CancelToken, PullPage, PushAck, PushAction, PushOp, RemoteBackend, TransportError};
pub use scheduler::{PullState, PushState, SyncScheduler};
pub use sync::{PullReport, PushReport};

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_channel::Receiver;
use tracing::{debug, warn};

use tidepool_core::hlc::{HlcClock, TimeSource};
use tidepool_core::{ContextId, EntityKind, FieldValue, Mutation, ORDER_FIELD, Placement, Row, RowId};
use tidepool_storage::{OUTBOX_TABLE, SYNC_META_TABLE, SqliteStorage, Store, StoreTx};

use crate::batch::WriteCtx;

/// The local-first data layer for one replica and one execution context.
///
/// Writes commit to the Local Store immediately and are mirrored into the
/// outbox in the same transaction; [`Engine::tick`], [`Engine::flush`] and
/// [`Engine::pull`] reconcile with the remote authority when one is attached.
pub struct Engine<K: EntityKind> {
    config: EngineConfig,
    clock: HlcClock,
    storage: SqliteStorage,
    scheduler: SyncScheduler,
    coordinator: ContextCoordinator,
    events: EventBus,
    remote: Option<Box<dyn RemoteBackend>>,
    cancel: CancelToken,
    _kinds: PhantomData<fn() -> K>,
}

impl<K: EntityKind> Engine<K> {
    pub fn new(
        config: EngineConfig,
        storage: SqliteStorage,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            scheduler: SyncScheduler::new(&config),
            coordinator: ContextCoordinator::new(config.grace_window_ms),
            clock: HlcClock::new(time),
            events: EventBus::new(),
            remote: None,
            cancel: CancelToken::new(),
            config,
            storage,
            _kinds: PhantomData,
        })
    }

    pub fn attach_remote(&mut self, remote: impl RemoteBackend + 'static) {
        self.remote = Some(Box::new(remote));
    }

    pub fn detach_remote(&mut self) -> Option<Box<dyn RemoteBackend>> {
        self.remote.take()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn context_id(&self) -> ContextId {
        self.coordinator.context_id()
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Token that aborts in-flight network work, e.g. when the context is torn down.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn subscribe(&mut self) -> Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn full_scope() -> Vec<&'static str> {
        K::all()
            .iter()
            .map(|k| k.name())
            .chain([OUTBOX_TABLE, SYNC_META_TABLE])
            .collect()
    }

    fn scope_for(kind: K) -> Vec<&'static str> {
        vec![kind.name(), OUTBOX_TABLE, SYNC_META_TABLE]
    }

    /// Run one local write transaction with a fresh stamp, then notify the
    /// scheduler and subscribers once it has committed.
    fn write<R>(
        &mut self,
        scope: &[&str],
        f: impl FnOnce(&mut StoreTx<'_>, &mut WriteCtx<'_>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let stamp = self.clock.tick()?;
        let now_ms = self.clock.physical_now()?;
        let Self {
            storage,
            coordinator,
            config,
            ..
        } = self;
        let (out, events) = storage.transaction(scope, |tx| {
            let mut ctx = WriteCtx::new(stamp, now_ms, &config.owner_key, coordinator);
            let out = f(tx, &mut ctx)?;
            Ok::<_, EngineError>((out, ctx.events))
        })?;
        if !events.is_empty() {
            self.scheduler.on_local_write(now_ms);
            self.events.emit(events);
        }
        Ok(out)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Create a row. Draggable tables get an order from their scope unless
    /// `fields` carries an explicit `order`.
    pub fn create<S: Into<String>>(
        &mut self,
        kind: K,
        fields: impl IntoIterator<Item = (S, FieldValue)>,
    ) -> Result<Row, EngineError> {
        self.create_with_id(kind, RowId::new(), fields)
    }

    pub fn create_with_id<S: Into<String>>(
        &mut self,
        kind: K,
        id: RowId,
        fields: impl IntoIterator<Item = (S, FieldValue)>,
    ) -> Result<Row, EngineError> {
        let op = BatchOp::create(kind, id, fields);
        self.write(&Self::scope_for(kind), |tx, ctx| {
            batch::create_row(tx, ctx, kind, id, &op.fields)
        })
    }

    /// Set some fields of a live row. Returns `None` if the row is missing or deleted.
    pub fn update<S: Into<String>>(
        &mut self,
        kind: K,
        id: RowId,
        fields: impl IntoIterator<Item = (S, FieldValue)>,
    ) -> Result<Option<Row>, EngineError> {
        let op = BatchOp::update(kind, id, fields);
        let result = self.write(&Self::scope_for(kind), |tx, ctx| {
            batch::update_row(tx, ctx, kind, id, &op.fields)
        });
        absent_if_gone(result)
    }

    /// Add `delta` to a counter field; merges additively with other replicas.
    pub fn increment(
        &mut self,
        kind: K,
        id: RowId,
        field: &str,
        delta: impl Into<FieldValue>,
    ) -> Result<Option<Row>, EngineError> {
        let delta = delta.into();
        let result = self.write(&Self::scope_for(kind), |tx, ctx| {
            batch::increment_row(tx, ctx, kind, id, field, delta)
        });
        absent_if_gone(result)
    }

    /// Soft-delete a row and cascade along its relationships, atomically.
    ///
    /// Returns the number of rows tombstoned or unlinked; deleting a missing
    /// row or an existing tombstone touches nothing.
    pub fn delete(&mut self, kind: K, id: RowId) -> Result<usize, EngineError> {
        let result = self.write(&Self::full_scope(), |tx, ctx| {
            batch::delete_row(tx, ctx, kind, id)
        });
        match result {
            Err(EngineError::RowNotFound { .. }) => Ok(0),
            other => {
                let touched = other?;
                debug!(table = kind.name(), %id, touched, "deleted");
                Ok(touched)
            }
        }
    }

    /// Persist an explicit order computed by the caller. Siblings are not renumbered.
    pub fn reorder(&mut self, kind: K, id: RowId, order: i64) -> Result<Option<Row>, EngineError> {
        self.update(kind, id, [(ORDER_FIELD, FieldValue::Integer(order))])
    }

    pub fn prepend_order(
        &self,
        kind: K,
        scope_index: &str,
        scope_key: &FieldValue,
    ) -> Result<i64, EngineError> {
        order::next_order(&self.storage, kind.name(), Some((scope_index, scope_key)), Placement::Prepend)
    }

    pub fn append_order(
        &self,
        kind: K,
        scope_index: &str,
        scope_key: &FieldValue,
    ) -> Result<i64, EngineError> {
        order::next_order(&self.storage, kind.name(), Some((scope_index, scope_key)), Placement::Append)
    }

    /// Apply `ops` in order as one transaction and return the resulting rows.
    pub fn batch_write(&mut self, ops: &[BatchOp<K>]) -> Result<Vec<Row>, EngineError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        self.write(&Self::full_scope(), |tx, ctx| batch::execute_ops(tx, ctx, ops))?;

        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for op in ops {
            if seen.insert(op.id)
                && let Some(row) = self.storage.get_row(op.table.name(), op.id)?
            {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Return the live row whose `index` equals `key`, creating it from
    /// `defaults` if neither this replica nor the remote has one.
    pub fn get_or_create<S: Into<String>>(
        &mut self,
        kind: K,
        index: &str,
        key: FieldValue,
        defaults: impl IntoIterator<Item = (S, FieldValue)>,
    ) -> Result<Row, EngineError> {
        if let Some(row) = self.query(kind, index, &key)?.into_iter().next() {
            return Ok(row);
        }

        if let Some(remote) = self.remote.as_mut() {
            match remote.find(kind.name(), index, &key) {
                Ok(found) => {
                    let live: Vec<Row> = found.into_iter().filter(|r| r.is_live()).collect();
                    if !live.is_empty() {
                        self.ingest(live, None, false)?;
                        if let Some(row) = self.query(kind, index, &key)?.into_iter().next() {
                            return Ok(row);
                        }
                    }
                }
                Err(err) => {
                    warn!(table = kind.name(), index, error = %err, "remote lookup failed, creating locally");
                }
            }
        }

        let mut fields: Vec<(String, FieldValue)> =
            defaults.into_iter().map(|(k, v)| (k.into(), v)).collect();
        fields.retain(|(k, _)| k != index);
        fields.push((index.to_string(), key));
        self.create(kind, fields)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A live row; tombstones read as absent.
    pub fn get(&self, kind: K, id: RowId) -> Result<Option<Row>, EngineError> {
        Ok(self
            .storage
            .get_row(kind.name(), id)?
            .filter(Row::is_live))
    }

    pub fn get_with_deleted(&self, kind: K, id: RowId) -> Result<Option<Row>, EngineError> {
        Ok(self.storage.get_row(kind.name(), id)?)
    }

    /// Live rows whose `index` field equals `key`, sorted by `(order, id)`.
    pub fn query(&self, kind: K, index: &str, key: &FieldValue) -> Result<Vec<Row>, EngineError> {
        Ok(self.storage.query_rows(kind.name(), index, key, false)?)
    }

    pub fn query_with_deleted(
        &self,
        kind: K,
        index: &str,
        key: &FieldValue,
    ) -> Result<Vec<Row>, EngineError> {
        Ok(self.storage.query_rows(kind.name(), index, key, true)?)
    }

    pub fn list(&self, kind: K) -> Result<Vec<Row>, EngineError> {
        Ok(self.storage.list_rows(kind.name(), false)?)
    }

    pub fn pending_count(&self) -> Result<u64, EngineError> {
        Ok(self.storage.outbox_len()?)
    }

    pub fn pending_for(&self, kind: K, id: RowId) -> Result<Vec<Mutation>, EngineError> {
        Ok(self
            .storage
            .pending_for_entity(id)?
            .into_iter()
            .filter(|m| m.table == kind.name())
            .collect())
    }

    /// Whether local edits to this row were discarded in favour of the remote
    /// and the user has not acknowledged it yet.
    pub fn has_pending_divergence(&self, _kind: K, id: RowId) -> Result<bool, EngineError> {
        Ok(self.storage.has_divergence(id)?)
    }

    pub fn divergent_rows(&self) -> Result<Vec<(String, RowId)>, EngineError> {
        Ok(self.storage.divergent_rows()?)
    }

    pub fn acknowledge_divergence(&mut self, _kind: K, id: RowId) -> Result<bool, EngineError> {
        Ok(self
            .storage
            .transaction(&[SYNC_META_TABLE], |tx| tx.clear_divergence(id))?)
    }
}

/// Map "row missing or deleted" to `None` for the single-row commands.
fn absent_if_gone(result: Result<Row, EngineError>) -> Result<Option<Row>, EngineError> {
    match result {
        Ok(row) => Ok(Some(row)),
        Err(EngineError::RowNotFound { .. } | EngineError::RowDeleted { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}
