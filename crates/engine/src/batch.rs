//! Atomic multi-row writes.
//!
//! Every local write goes through the row functions here. All ops in a batch
//! share one stamp and one transaction, so either every row, outbox entry and
//! announcement lands or none does.

use std::collections::BTreeMap;

use tidepool_core::{
    EntityKind, FieldValue, Hlc, Mutation, MutationPayload, ORDER_FIELD, Row, RowId,
};
use tidepool_storage::{Store, StoreTx};

use crate::coordinator::ContextCoordinator;
use crate::error::EngineError;
use crate::events::{ChangeEvent, ChangeKind, ChangeOrigin};
use crate::order::next_order;
use crate::outbox;
use crate::tombstone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOp<K> {
    pub kind: BatchKind,
    pub table: K,
    pub id: RowId,
    pub fields: BTreeMap<String, FieldValue>,
}

fn collect_fields<S: Into<String>>(
    fields: impl IntoIterator<Item = (S, FieldValue)>,
) -> BTreeMap<String, FieldValue> {
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

impl<K> BatchOp<K> {
    pub fn create<S: Into<String>>(
        table: K,
        id: RowId,
        fields: impl IntoIterator<Item = (S, FieldValue)>,
    ) -> Self {
        Self {
            kind: BatchKind::Create,
            table,
            id,
            fields: collect_fields(fields),
        }
    }

    pub fn update<S: Into<String>>(
        table: K,
        id: RowId,
        fields: impl IntoIterator<Item = (S, FieldValue)>,
    ) -> Self {
        Self {
            kind: BatchKind::Update,
            table,
            id,
            fields: collect_fields(fields),
        }
    }

    pub fn delete(table: K, id: RowId) -> Self {
        Self {
            kind: BatchKind::Delete,
            table,
            id,
            fields: BTreeMap::new(),
        }
    }
}

/// Per-transaction write context shared by every op of one batch.
pub(crate) struct WriteCtx<'a> {
    pub stamp: Hlc,
    pub now_ms: u64,
    pub owner_key: &'a str,
    pub coordinator: &'a ContextCoordinator,
    pub events: Vec<ChangeEvent>,
}

impl<'a> WriteCtx<'a> {
    pub fn new(stamp: Hlc, now_ms: u64, owner_key: &'a str, coordinator: &'a ContextCoordinator) -> Self {
        Self {
            stamp,
            now_ms,
            owner_key,
            coordinator,
            events: Vec::new(),
        }
    }

    /// Persist `row`, enqueue the mutations describing the change and announce the write.
    fn record(
        &mut self,
        tx: &mut StoreTx<'_>,
        row: &Row,
        change: ChangeKind,
        mutations: Vec<Mutation>,
    ) -> Result<(), EngineError> {
        tx.put_row(row)?;
        for m in mutations {
            outbox::enqueue(tx, m)?;
        }
        self.coordinator.announce(tx, &row.table, row.id, self.now_ms)?;
        self.events.push(ChangeEvent {
            table: row.table.clone(),
            id: row.id,
            change,
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }
}

fn load_live<K: EntityKind>(tx: &StoreTx<'_>, kind: K, id: RowId) -> Result<Row, EngineError> {
    match tx.get_row(kind.name(), id)? {
        None => Err(EngineError::not_found(kind.name(), id)),
        Some(row) if row.deleted => Err(EngineError::deleted(kind.name(), id)),
        Some(row) => Ok(row),
    }
}

pub(crate) fn create_row<K: EntityKind>(
    tx: &mut StoreTx<'_>,
    ctx: &mut WriteCtx<'_>,
    kind: K,
    id: RowId,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<Row, EngineError> {
    let table = kind.name();
    if tx.get_row(table, id)?.is_some() {
        return Err(EngineError::RowExists {
            table: table.to_string(),
            id: id.to_string(),
        });
    }

    let mut row = Row::new(id, table, ctx.owner_key, ctx.stamp);
    for (key, value) in fields {
        row.set_field(key, value.clone(), ctx.stamp)?;
    }
    if !fields.contains_key(ORDER_FIELD)
        && let Some(scope) = kind.order_scope()
    {
        let scope_key = row.field(scope.scope_field).cloned();
        let order = next_order(
            &*tx,
            table,
            scope_key.as_ref().map(|v| (scope.scope_field, v)),
            scope.placement,
        )?;
        row.set_field(ORDER_FIELD, FieldValue::Integer(order), ctx.stamp)?;
    }

    let create = Mutation::new(
        table,
        id,
        MutationPayload::Create { row: row.clone() },
        ctx.stamp,
    );
    ctx.record(tx, &row, ChangeKind::Created, vec![create])?;
    Ok(row)
}

pub(crate) fn update_row<K: EntityKind>(
    tx: &mut StoreTx<'_>,
    ctx: &mut WriteCtx<'_>,
    kind: K,
    id: RowId,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<Row, EngineError> {
    let table = kind.name();
    let mut row = load_live(tx, kind, id)?;
    if fields.is_empty() {
        return Ok(row);
    }

    let mut mutations = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        row.set_field(key, value.clone(), ctx.stamp)?;
        mutations.push(Mutation::new(
            table,
            id,
            MutationPayload::Set {
                field: key.clone(),
                value: value.clone(),
            },
            ctx.stamp,
        ));
    }
    ctx.record(tx, &row, ChangeKind::Updated, mutations)?;
    Ok(row)
}

pub(crate) fn increment_row<K: EntityKind>(
    tx: &mut StoreTx<'_>,
    ctx: &mut WriteCtx<'_>,
    kind: K,
    id: RowId,
    field: &str,
    delta: FieldValue,
) -> Result<Row, EngineError> {
    if !delta.is_numeric() || field == ORDER_FIELD {
        return Err(EngineError::InvalidBatch(format!(
            "cannot increment {field} by {delta:?}"
        )));
    }
    let mut row = load_live(tx, kind, id)?;
    let base_version = row.field_version(field);
    let sum = FieldValue::add(row.field(field), &delta)?;
    row.set_field(field, sum, ctx.stamp)?;

    let m = Mutation::new(
        kind.name(),
        id,
        MutationPayload::Increment {
            field: field.to_string(),
            delta,
        },
        ctx.stamp,
    )
    .with_base_version(base_version);
    ctx.record(tx, &row, ChangeKind::Updated, vec![m])?;
    Ok(row)
}

/// Tombstone `id` and everything its relationships cascade to.
///
/// Deleting a row that is already a tombstone is a no-op.
pub(crate) fn delete_row<K: EntityKind>(
    tx: &mut StoreTx<'_>,
    ctx: &mut WriteCtx<'_>,
    kind: K,
    id: RowId,
) -> Result<usize, EngineError> {
    match tx.get_row(kind.name(), id)? {
        None => return Err(EngineError::not_found(kind.name(), id)),
        Some(row) if row.deleted => return Ok(0),
        Some(_) => {}
    }

    let plan = tombstone::discover(&*tx, kind, id)?;
    let mut touched = 0;
    for (child_kind, child_id) in &plan.deletes {
        let Some(mut row) = tx.get_row(child_kind.name(), *child_id)? else {
            continue;
        };
        if row.deleted {
            continue;
        }
        row.tombstone(ctx.stamp);
        let m = Mutation::new(
            child_kind.name(),
            *child_id,
            MutationPayload::Delete {
                deleted_at: ctx.stamp,
            },
            ctx.stamp,
        );
        ctx.record(tx, &row, ChangeKind::Deleted, vec![m])?;
        touched += 1;
    }
    for (child_kind, child_id, foreign_key) in &plan.unlinks {
        let Some(mut row) = tx.get_row(child_kind.name(), *child_id)? else {
            continue;
        };
        row.set_field(foreign_key, FieldValue::Null, ctx.stamp)?;
        let m = Mutation::new(
            child_kind.name(),
            *child_id,
            MutationPayload::Set {
                field: foreign_key.to_string(),
                value: FieldValue::Null,
            },
            ctx.stamp,
        );
        ctx.record(tx, &row, ChangeKind::Updated, vec![m])?;
        touched += 1;
    }
    Ok(touched)
}

/// Apply `ops` in order inside an open transaction.
pub(crate) fn execute_ops<K: EntityKind>(
    tx: &mut StoreTx<'_>,
    ctx: &mut WriteCtx<'_>,
    ops: &[BatchOp<K>],
) -> Result<(), EngineError> {
    for op in ops {
        match op.kind {
            BatchKind::Create => {
                create_row(tx, ctx, op.table, op.id, &op.fields)?;
            }
            BatchKind::Update => {
                update_row(tx, ctx, op.table, op.id, &op.fields)?;
            }
            BatchKind::Delete => {
                if !op.fields.is_empty() {
                    return Err(EngineError::InvalidBatch(format!(
                        "delete of {} carries fields",
                        op.id
                    )));
                }
                delete_row(tx, ctx, op.table, op.id)?;
            }
        }
    }
    Ok(())
}
