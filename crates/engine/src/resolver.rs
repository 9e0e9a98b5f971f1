//! Conflict resolution between local state and remote snapshots.
//!
//! Fields merge by last-write-wins on their per-field stamps, counters merge
//! additively, and a tombstone beats every concurrent edit.

use std::collections::{BTreeMap, BTreeSet};

use tidepool_core::{CoreError, FieldValue, Hlc, Mutation, MutationPayload, OpId, Row};

use crate::remote::PushAction;

/// What to do with one outbox entry given the remote's current snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum PushDecision {
    Send(PushAction),
    /// The remote already reflects this entry; drop it.
    AlreadyApplied,
    /// The remote holds a newer value or a tombstone; drop the entry and merge.
    RemoteWins,
    /// Not sendable yet, e.g. a counter on a row the remote does not have.
    Defer,
}

pub fn resolve_push(m: &Mutation, remote: Option<&Row>) -> Result<PushDecision, CoreError> {
    match &m.payload {
        MutationPayload::Create { row } => Ok(match remote {
            None => PushDecision::Send(PushAction::Create(row.clone())),
            Some(remote) if remote.deleted => PushDecision::RemoteWins,
            Some(remote) => {
                // The create landed earlier; resend only what the remote lacks.
                let fields: BTreeMap<String, FieldValue> = written_keys(row)
                    .into_iter()
                    .filter(|k| row.field_version(k) > remote.field_version(k))
                    .filter_map(|k| row.value_of(&k).map(|v| (k, v)))
                    .collect();
                if fields.is_empty() {
                    PushDecision::AlreadyApplied
                } else {
                    PushDecision::Send(PushAction::SetFields {
                        fields,
                        stamp: m.enqueued_at,
                    })
                }
            }
        }),

        MutationPayload::Set { field, value } => Ok(match remote {
            Some(remote) if remote.deleted => PushDecision::RemoteWins,
            Some(remote) if m.enqueued_at <= remote.field_version(field) => {
                if remote.value_of(field).as_ref() == Some(value) {
                    PushDecision::AlreadyApplied
                } else {
                    PushDecision::RemoteWins
                }
            }
            _ => PushDecision::Send(PushAction::SetFields {
                fields: BTreeMap::from([(field.clone(), value.clone())]),
                stamp: m.enqueued_at,
            }),
        }),

        MutationPayload::Increment { field, delta } => {
            let Some(remote) = remote else {
                return Ok(PushDecision::Defer);
            };
            if remote.deleted {
                return Ok(PushDecision::RemoteWins);
            }
            if contribution(m, field, remote) == Contribution::Reflected {
                return Ok(PushDecision::AlreadyApplied);
            }
            // Missing or Unknown: a retried op that did land is answered as a
            // duplicate by its op id, so resending cannot count it twice.
            let expected = remote.field_version(field);
            Ok(PushDecision::Send(PushAction::WriteCounter {
                field: field.clone(),
                value: FieldValue::add(remote.field(field), delta)?,
                expected,
                stamp: m.enqueued_at.max(expected.successor()),
            }))
        }

        MutationPayload::Delete { deleted_at } => Ok(match remote {
            Some(remote) if remote.deleted => PushDecision::AlreadyApplied,
            _ => PushDecision::Send(PushAction::Tombstone {
                deleted_at: *deleted_at,
            }),
        }),
    }
}

/// Whether a remote counter already includes a pending increment's delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    /// The remote field carries the stamp this entry wrote on its last attempt.
    Reflected,
    /// The entry was never sent, or the remote field is still at the version
    /// the first delta was applied on.
    Missing,
    /// An earlier attempt may have landed and been overwritten since.
    Unknown,
}

pub fn contribution(m: &Mutation, field: &str, remote: &Row) -> Contribution {
    let current = remote.field_version(field);
    if m.pushed_stamp == Some(current) {
        Contribution::Reflected
    } else if m.attempts == 0 || m.base_version == Some(current) {
        Contribution::Missing
    } else {
        Contribution::Unknown
    }
}

/// The remote row as it will look once `action` is applied.
///
/// Field writes follow the same last-write-wins rule the remote applies, so
/// a write older than the remote's field version leaves that field alone.
pub fn project(remote: Option<&Row>, action: &PushAction) -> Result<Option<Row>, CoreError> {
    match action {
        PushAction::Create(row) => Ok(Some(row.clone())),
        PushAction::SetFields { fields, stamp } => write_fields(remote, fields, *stamp),
        PushAction::WriteCounter {
            field,
            value,
            stamp,
            ..
        } => write_fields(remote, [(field, value)], *stamp),
        PushAction::Tombstone { deleted_at } => Ok(remote.map(|r| {
            let mut next = r.clone();
            if !next.deleted {
                next.tombstone(*deleted_at);
            }
            next
        })),
    }
}

fn write_fields<'a>(
    remote: Option<&Row>,
    fields: impl IntoIterator<Item = (&'a String, &'a FieldValue)>,
    stamp: Hlc,
) -> Result<Option<Row>, CoreError> {
    let Some(remote) = remote else {
        return Ok(None);
    };
    let mut next = remote.clone();
    for (key, value) in fields {
        if stamp > next.field_version(key) {
            next.set_field(key, value.clone(), stamp)?;
        }
    }
    Ok(Some(next))
}

/// Result of folding a remote snapshot into local state.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub row: Row,
    /// Outbox entries the remote has made redundant or overruled.
    pub dropped: Vec<OpId>,
    /// Local edits were discarded in favour of the remote.
    pub divergent: bool,
}

/// Merge `remote` into `local`, honouring the entity's `pending` outbox entries.
pub fn merge_remote(
    local: Option<&Row>,
    pending: &[Mutation],
    remote: &Row,
) -> Result<MergeOutcome, CoreError> {
    let Some(local) = local else {
        return Ok(MergeOutcome {
            row: remote.clone(),
            dropped: Vec::new(),
            divergent: false,
        });
    };

    let pending_delete: Vec<OpId> = pending
        .iter()
        .filter(|m| matches!(m.payload, MutationPayload::Delete { .. }))
        .map(|m| m.op_id)
        .collect();
    if !pending_delete.is_empty() {
        return Ok(MergeOutcome {
            row: local.clone(),
            dropped: if remote.deleted { pending_delete } else { Vec::new() },
            divergent: false,
        });
    }

    if remote.deleted {
        return Ok(MergeOutcome {
            row: remote.clone(),
            dropped: pending.iter().map(|m| m.op_id).collect(),
            divergent: !pending.is_empty(),
        });
    }

    if local.deleted {
        return Ok(MergeOutcome {
            row: local.clone(),
            dropped: Vec::new(),
            divergent: false,
        });
    }

    let mut merged = remote.clone();
    let mut dropped = Vec::new();
    let mut divergent = false;
    let mut handled = BTreeSet::new();
    let mut kept_local = BTreeSet::new();

    for m in pending {
        if let MutationPayload::Set { field, value } = &m.payload {
            if m.enqueued_at > remote.field_version(field) {
                keep_local(&mut merged, local, field)?;
                kept_local.insert(field.clone());
            } else {
                dropped.push(m.op_id);
                if remote.value_of(field).as_ref() != Some(value) {
                    divergent = true;
                }
            }
            handled.insert(field.clone());
        }
    }

    for m in pending {
        if let MutationPayload::Increment { field, delta } = &m.payload {
            if contribution(m, field, remote) == Contribution::Reflected {
                dropped.push(m.op_id);
            } else if !kept_local.contains(field) {
                // Rebase on the remote value; a winning local set already holds these deltas.
                let sum = FieldValue::add(merged.field(field), delta)?;
                let version = merged.field_version(field);
                merged.fields.insert(field.clone(), sum);
                merged.field_versions.insert(field.clone(), version);
            }
            handled.insert(field.clone());
        }
    }

    for key in written_keys(local) {
        if !handled.contains(&key) && local.field_version(&key) > remote.field_version(&key) {
            keep_local(&mut merged, local, &key)?;
        }
    }
    merged.updated_at = merged.updated_at.max(local.updated_at);

    Ok(MergeOutcome {
        row: merged,
        dropped,
        divergent,
    })
}

fn written_keys(row: &Row) -> BTreeSet<String> {
    row.field_versions
        .keys()
        .chain(row.fields.keys())
        .cloned()
        .collect()
}

fn keep_local(merged: &mut Row, local: &Row, key: &str) -> Result<(), CoreError> {
    match local.value_of(key) {
        Some(value) => merged.set_field(key, value, local.field_version(key)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_core::RowId;

    fn goal(id: RowId, value: i64, version: Hlc) -> Row {
        let mut row = Row::new(id, "goal", "owner", Hlc::new(1, 0));
        row.set_field("current_value", FieldValue::Integer(value), version)
            .unwrap();
        row.set_field("title", "Read".into(), Hlc::new(1, 0)).unwrap();
        row
    }

    fn set(id: RowId, field: &str, value: FieldValue, at: Hlc) -> Mutation {
        Mutation::new(
            "goal",
            id,
            MutationPayload::Set {
                field: field.into(),
                value,
            },
            at,
        )
    }

    fn inc(id: RowId, delta: i64, at: Hlc) -> Mutation {
        Mutation::new(
            "goal",
            id,
            MutationPayload::Increment {
                field: "current_value".into(),
                delta: FieldValue::Integer(delta),
            },
            at,
        )
    }

    #[test]
    fn newer_set_is_sent_and_older_set_loses() {
        let id = RowId::new();
        let remote = goal(id, 0, Hlc::new(5, 0));
        let mut remote_titled = remote.clone();
        remote_titled
            .set_field("title", "Write".into(), Hlc::new(20, 0))
            .unwrap();

        let newer = set(id, "title", "Run".into(), Hlc::new(30, 0));
        assert!(matches!(
            resolve_push(&newer, Some(&remote_titled)).unwrap(),
            PushDecision::Send(PushAction::SetFields { .. })
        ));

        let older = set(id, "title", "Run".into(), Hlc::new(10, 0));
        assert_eq!(
            resolve_push(&older, Some(&remote_titled)).unwrap(),
            PushDecision::RemoteWins
        );

        let same = set(id, "title", "Write".into(), Hlc::new(20, 0));
        assert_eq!(
            resolve_push(&same, Some(&remote_titled)).unwrap(),
            PushDecision::AlreadyApplied
        );
    }

    #[test]
    fn counter_push_is_compare_and_set_on_remote_base() {
        let id = RowId::new();
        let remote = goal(id, 3, Hlc::new(40, 0));
        let m = inc(id, 2, Hlc::new(30, 0));
        let PushDecision::Send(PushAction::WriteCounter {
            value,
            expected,
            stamp,
            ..
        }) = resolve_push(&m, Some(&remote)).unwrap()
        else {
            panic!("expected counter write");
        };
        assert_eq!(value, FieldValue::Integer(5));
        assert_eq!(expected, Hlc::new(40, 0));
        assert!(stamp > expected);
    }

    #[test]
    fn counter_already_written_by_previous_attempt_is_not_reapplied() {
        let id = RowId::new();
        let remote = goal(id, 5, Hlc::new(41, 0));
        let mut m = inc(id, 2, Hlc::new(30, 0));
        m.pushed_stamp = Some(Hlc::new(41, 0));
        assert_eq!(
            resolve_push(&m, Some(&remote)).unwrap(),
            PushDecision::AlreadyApplied
        );
    }

    #[test]
    fn counter_contribution_is_read_from_base_and_pushed_stamps() {
        let id = RowId::new();
        let mut m = inc(id, 2, Hlc::new(30, 0)).with_base_version(Hlc::new(20, 0));

        let untouched = goal(id, 3, Hlc::new(20, 0));
        assert_eq!(contribution(&m, "current_value", &untouched), Contribution::Missing);

        // A failed attempt against an unchanged remote still needs sending.
        m.attempts = 1;
        m.pushed_stamp = Some(Hlc::new(30, 0));
        assert_eq!(contribution(&m, "current_value", &untouched), Contribution::Missing);

        let landed = goal(id, 5, Hlc::new(30, 0));
        assert_eq!(contribution(&m, "current_value", &landed), Contribution::Reflected);

        let moved_on = goal(id, 6, Hlc::new(35, 0));
        assert_eq!(contribution(&m, "current_value", &moved_on), Contribution::Unknown);
        assert!(matches!(
            resolve_push(&m, Some(&moved_on)).unwrap(),
            PushDecision::Send(PushAction::WriteCounter { expected, .. }) if expected == Hlc::new(35, 0)
        ));
    }

    #[test]
    fn counter_on_unknown_row_waits() {
        let m = inc(RowId::new(), 1, Hlc::new(30, 0));
        assert_eq!(resolve_push(&m, None).unwrap(), PushDecision::Defer);
    }

    #[test]
    fn delete_of_tombstoned_row_is_already_applied() {
        let id = RowId::new();
        let mut remote = goal(id, 0, Hlc::new(5, 0));
        remote.tombstone(Hlc::new(9, 0));
        let m = Mutation::new(
            "goal",
            id,
            MutationPayload::Delete {
                deleted_at: Hlc::new(10, 0),
            },
            Hlc::new(10, 0),
        );
        assert_eq!(
            resolve_push(&m, Some(&remote)).unwrap(),
            PushDecision::AlreadyApplied
        );
    }

    #[test]
    fn merge_rebases_pending_increments_on_remote_value() {
        let id = RowId::new();
        let mut local = goal(id, 0, Hlc::new(5, 0));
        local
            .set_field("current_value", FieldValue::Integer(3), Hlc::new(30, 0))
            .unwrap();
        let remote = goal(id, 2, Hlc::new(20, 0));
        let pending = vec![inc(id, 3, Hlc::new(30, 0))];

        let out = merge_remote(Some(&local), &pending, &remote).unwrap();
        assert_eq!(out.row.field("current_value"), Some(&FieldValue::Integer(5)));
        assert!(out.dropped.is_empty());
        assert!(!out.divergent);
    }

    #[test]
    fn merge_keeps_newer_pending_set_and_drops_older_one() {
        let id = RowId::new();
        let mut local = goal(id, 0, Hlc::new(5, 0));
        local.set_field("title", "Mine".into(), Hlc::new(30, 0)).unwrap();
        let mut remote = goal(id, 0, Hlc::new(5, 0));
        remote.set_field("title", "Theirs".into(), Hlc::new(20, 0)).unwrap();

        let newer = vec![set(id, "title", "Mine".into(), Hlc::new(30, 0))];
        let out = merge_remote(Some(&local), &newer, &remote).unwrap();
        assert_eq!(out.row.field("title"), Some(&FieldValue::Text("Mine".into())));
        assert!(out.dropped.is_empty());

        remote.set_field("title", "Theirs".into(), Hlc::new(40, 0)).unwrap();
        let out = merge_remote(Some(&local), &newer, &remote).unwrap();
        assert_eq!(out.row.field("title"), Some(&FieldValue::Text("Theirs".into())));
        assert_eq!(out.dropped, vec![newer[0].op_id]);
        assert!(out.divergent);
    }

    #[test]
    fn remote_tombstone_discards_pending_edits() {
        let id = RowId::new();
        let local = goal(id, 0, Hlc::new(5, 0));
        let mut remote = local.clone();
        remote.tombstone(Hlc::new(50, 0));
        let pending = vec![set(id, "title", "Mine".into(), Hlc::new(30, 0))];

        let out = merge_remote(Some(&local), &pending, &remote).unwrap();
        assert!(out.row.deleted);
        assert_eq!(out.dropped, vec![pending[0].op_id]);
        assert!(out.divergent);
    }

    #[test]
    fn stale_snapshot_does_not_roll_back_acknowledged_write() {
        let id = RowId::new();
        let mut local = goal(id, 0, Hlc::new(5, 0));
        local.set_field("title", "New".into(), Hlc::new(30, 0)).unwrap();
        let remote = goal(id, 0, Hlc::new(5, 0));

        let out = merge_remote(Some(&local), &[], &remote).unwrap();
        assert_eq!(out.row.field("title"), Some(&FieldValue::Text("New".into())));
    }

    #[test]
    fn local_tombstone_survives_live_snapshot() {
        let id = RowId::new();
        let mut local = goal(id, 0, Hlc::new(5, 0));
        local.tombstone(Hlc::new(30, 0));
        let remote = goal(id, 0, Hlc::new(5, 0));
        let out = merge_remote(Some(&local), &[], &remote).unwrap();
        assert!(out.row.deleted);
    }

    #[test]
    fn projection_applies_counter_write_and_ignores_older_fields() {
        let id = RowId::new();
        let remote = goal(id, 3, Hlc::new(40, 0));
        let counter = PushAction::WriteCounter {
            field: "current_value".into(),
            value: FieldValue::Integer(5),
            expected: Hlc::new(40, 0),
            stamp: Hlc::new(40, 1),
        };
        let next = project(Some(&remote), &counter).unwrap().unwrap();
        assert_eq!(next.field("current_value"), Some(&FieldValue::Integer(5)));
        assert_eq!(next.field_version("current_value"), Hlc::new(40, 1));

        let old = PushAction::SetFields {
            fields: BTreeMap::from([("current_value".to_string(), FieldValue::Integer(0))]),
            stamp: Hlc::new(10, 0),
        };
        let unchanged = project(Some(&next), &old).unwrap().unwrap();
        assert_eq!(unchanged.field("current_value"), Some(&FieldValue::Integer(5)));
    }
}
