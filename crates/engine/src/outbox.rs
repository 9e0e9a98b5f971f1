//! Coalescing rules for the mutation outbox.
//!
//! Only entries that have never been sent are rewritten. Once an entry has
//! been attempted the remote may already hold it under its op_id, so later
//! writes open a fresh entry instead of changing what a retry would resend.

use tracing::debug;

use tidepool_core::{CoreError, FieldValue, Mutation, MutationPayload, OpId};
use tidepool_storage::{Store, StoreTx};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum OutboxChange {
    Insert(Mutation),
    Update(Mutation),
    Remove(OpId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Appended,
    /// Merged into an existing entry of the same kind and field.
    Coalesced,
    /// Merged into the entity's pending create.
    Folded,
    /// A delete replaced `n` pending entries.
    Superseded(usize),
    /// A delete cancelled a create that never left this replica.
    Collapsed,
    /// The entity already has a pending delete.
    Dropped,
}

fn unsent(m: &Mutation) -> bool {
    m.attempts == 0
}

/// Decide how `incoming` combines with the entity's `pending` entries (in seq order).
pub fn plan(
    pending: &[Mutation],
    incoming: Mutation,
) -> Result<(EnqueueOutcome, Vec<OutboxChange>), CoreError> {
    if pending
        .iter()
        .any(|m| matches!(m.payload, MutationPayload::Delete { .. }))
    {
        return Ok((EnqueueOutcome::Dropped, Vec::new()));
    }

    let unsent_create = pending
        .iter()
        .find(|m| unsent(m) && matches!(m.payload, MutationPayload::Create { .. }));

    match &incoming.payload {
        MutationPayload::Create { .. } => {
            if !pending.is_empty() {
                return Err(CoreError::InvalidMutation(format!(
                    "entity {} already has pending mutations",
                    incoming.entity_id
                )));
            }
            Ok((EnqueueOutcome::Appended, vec![OutboxChange::Insert(incoming)]))
        }

        MutationPayload::Delete { .. } => {
            let removed: Vec<OutboxChange> = pending
                .iter()
                .map(|m| OutboxChange::Remove(m.op_id))
                .collect();
            if unsent_create.is_some() {
                return Ok((EnqueueOutcome::Collapsed, removed));
            }
            let n = removed.len();
            let mut changes = removed;
            changes.push(OutboxChange::Insert(incoming));
            if n == 0 {
                Ok((EnqueueOutcome::Appended, changes))
            } else {
                Ok((EnqueueOutcome::Superseded(n), changes))
            }
        }

        MutationPayload::Set { field, value } => {
            if let Some(create) = unsent_create {
                let mut create = create.clone();
                if let MutationPayload::Create { row } = &mut create.payload {
                    row.set_field(field, value.clone(), incoming.enqueued_at)?;
                }
                create.enqueued_at = incoming.enqueued_at;
                return Ok((EnqueueOutcome::Folded, vec![OutboxChange::Update(create)]));
            }
            let existing = pending.iter().find(|m| {
                unsent(m)
                    && matches!(&m.payload, MutationPayload::Set { field: f, .. } if f == field)
            });
            match existing {
                Some(existing) => {
                    let mut replaced = existing.clone();
                    replaced.payload = incoming.payload.clone();
                    replaced.enqueued_at = incoming.enqueued_at;
                    Ok((EnqueueOutcome::Coalesced, vec![OutboxChange::Update(replaced)]))
                }
                None => Ok((EnqueueOutcome::Appended, vec![OutboxChange::Insert(incoming)])),
            }
        }

        MutationPayload::Increment { field, delta } => {
            if let Some(create) = unsent_create {
                let mut create = create.clone();
                if let MutationPayload::Create { row } = &mut create.payload {
                    let sum = FieldValue::add(row.field(field), delta)?;
                    row.set_field(field, sum, incoming.enqueued_at)?;
                }
                create.enqueued_at = incoming.enqueued_at;
                return Ok((EnqueueOutcome::Folded, vec![OutboxChange::Update(create)]));
            }
            let existing = pending.iter().find(|m| {
                unsent(m)
                    && matches!(&m.payload, MutationPayload::Increment { field: f, .. } if f == field)
            });
            match existing {
                Some(existing) => {
                    let mut merged = existing.clone();
                    if let MutationPayload::Increment { delta: acc, .. } = &mut merged.payload {
                        *acc = FieldValue::add(Some(acc), delta)?;
                    }
                    // base_version stays the one captured by the first delta.
                    merged.enqueued_at = incoming.enqueued_at;
                    Ok((EnqueueOutcome::Coalesced, vec![OutboxChange::Update(merged)]))
                }
                None => Ok((EnqueueOutcome::Appended, vec![OutboxChange::Insert(incoming)])),
            }
        }
    }
}

/// Enqueue `incoming` inside an open transaction, applying the coalescing rules.
pub(crate) fn enqueue(tx: &mut StoreTx<'_>, incoming: Mutation) -> Result<EnqueueOutcome, EngineError> {
    let entity_id = incoming.entity_id;
    let kind = incoming.kind();
    let pending = tx.pending_for_entity(entity_id)?;
    let (outcome, changes) = plan(&pending, incoming)?;
    for change in changes {
        match change {
            OutboxChange::Insert(mut m) => tx.insert_mutation(&mut m)?,
            OutboxChange::Update(m) => tx.update_mutation(&m)?,
            OutboxChange::Remove(op_id) => {
                tx.remove_mutation(op_id)?;
            }
        }
    }
    debug!(entity = %entity_id, kind = kind.as_str(), ?outcome, "enqueued mutation");
    Ok(outcome)
}
