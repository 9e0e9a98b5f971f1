use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use tidepool_core::{FieldValue, OpId, Row, RowId};
use tidepool_engine::{PullPage, PushAck, PushAction, PushOp, RemoteBackend, TransportError};

#[derive(Default)]
struct RemoteState {
    rows: HashMap<RowId, Row>,
    applied: HashSet<OpId>,
    /// Change feed: one snapshot per accepted change, indexed by cursor.
    feed: Vec<Row>,
    offline: bool,
    /// Number of upcoming pushes whose acknowledgement is lost after applying.
    lose_acks: usize,
    push_calls: usize,
}

impl RemoteState {
    fn record(&mut self, row: Row) {
        self.feed.push(row.clone());
        self.rows.insert(row.id, row);
    }

    fn apply(&mut self, op: &PushOp) -> PushAck {
        if self.applied.contains(&op.op_id) {
            return PushAck::Duplicate;
        }
        let current = self.rows.get(&op.id).filter(|r| r.table == op.table).cloned();
        let ack = match (&op.action, current) {
            (PushAction::Create(row), None) => {
                if self.rows.contains_key(&op.id) {
                    return PushAck::Rejected(format!("{} exists in another table", op.id));
                }
                if let Err(err) = row.validate() {
                    return PushAck::Rejected(err.to_string());
                }
                self.record(row.clone());
                PushAck::Applied
            }
            (PushAction::Create(_), Some(_)) => PushAck::Rejected(format!("{} already exists", op.id)),
            (PushAction::Tombstone { .. }, None) => PushAck::Applied,
            (_, None) => PushAck::Rejected(format!("{} does not exist", op.id)),
            (PushAction::Tombstone { deleted_at }, Some(mut row)) => {
                if !row.deleted {
                    row.tombstone(*deleted_at);
                    self.record(row);
                }
                PushAck::Applied
            }
            (_, Some(row)) if row.deleted => PushAck::Rejected(format!("{} is deleted", op.id)),
            (PushAction::SetFields { fields, stamp }, Some(mut row)) => {
                let mut changed = false;
                for (key, value) in fields {
                    if *stamp > row.field_version(key) {
                        if let Err(err) = row.set_field(key, value.clone(), *stamp) {
                            return PushAck::Rejected(err.to_string());
                        }
                        changed = true;
                    }
                }
                if changed {
                    self.record(row);
                }
                PushAck::Applied
            }
            (
                PushAction::WriteCounter {
                    field,
                    value,
                    expected,
                    stamp,
                },
                Some(mut row),
            ) => {
                if row.field_version(field) != *expected {
                    return PushAck::Stale;
                }
                if let Err(err) = row.set_field(field, value.clone(), *stamp) {
                    return PushAck::Rejected(err.to_string());
                }
                self.record(row);
                PushAck::Applied
            }
        };
        if ack == PushAck::Applied {
            self.applied.insert(op.op_id);
        }
        ack
    }
}

/// An in-process remote authority shared by every test peer.
///
/// Clones share state. It applies pushes by op_id at most once, treats
/// counter writes as compare-and-set, and serves a change feed by cursor.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        // A panicking test thread must not hide the remote from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Apply the next `n` pushes but fail them as if the connection dropped.
    pub fn lose_next_acks(&self, n: usize) {
        self.state().lose_acks = n;
    }

    pub fn push_calls(&self) -> usize {
        self.state().push_calls
    }

    pub fn row(&self, id: RowId) -> Option<Row> {
        self.state().rows.get(&id).cloned()
    }

    pub fn live_rows(&self, table: &str) -> Vec<Row> {
        self.state()
            .rows
            .values()
            .filter(|r| r.table == table && r.is_live())
            .cloned()
            .collect()
    }

    /// Put `row` on the change feed as-is, without validation.
    pub fn inject_feed(&self, row: Row) {
        self.state().feed.push(row);
    }

    fn check_online(state: &RemoteState) -> Result<(), TransportError> {
        if state.offline {
            Err(TransportError::Unreachable("remote offline".into()))
        } else {
            Ok(())
        }
    }
}

impl RemoteBackend for MemoryRemote {
    fn push(&mut self, ops: &[PushOp]) -> Result<Vec<PushAck>, TransportError> {
        let mut state = self.state();
        Self::check_online(&state)?;
        state.push_calls += 1;
        let acks: Vec<PushAck> = ops.iter().map(|op| state.apply(op)).collect();
        debug!(ops = ops.len(), "remote applied push");
        if state.lose_acks > 0 {
            state.lose_acks -= 1;
            return Err(TransportError::Unreachable("connection lost".into()));
        }
        Ok(acks)
    }

    fn pull(&mut self, since: Option<u64>, limit: usize) -> Result<PullPage, TransportError> {
        let state = self.state();
        Self::check_online(&state)?;
        let start = (since.unwrap_or(0) as usize).min(state.feed.len());
        let end = start.saturating_add(limit).min(state.feed.len());
        Ok(PullPage {
            rows: state.feed[start..end].to_vec(),
            cursor: end as u64,
        })
    }

    fn fetch(&mut self, table: &str, ids: &[RowId]) -> Result<Vec<Row>, TransportError> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id))
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    fn find(&mut self, table: &str, index: &str, key: &FieldValue) -> Result<Vec<Row>, TransportError> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state
            .rows
            .values()
            .filter(|r| r.table == table && r.is_live() && r.field(index) == Some(key))
            .cloned()
            .collect())
    }
}

/// One replica's connection to a [`MemoryRemote`], with its own offline switch.
#[derive(Clone)]
pub struct RemoteLink {
    remote: MemoryRemote,
    online: Arc<AtomicBool>,
}

impl RemoteLink {
    pub fn new(remote: MemoryRemote) -> Self {
        Self {
            remote,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Unreachable("replica offline".into()))
        }
    }
}

impl RemoteBackend for RemoteLink {
    fn push(&mut self, ops: &[PushOp]) -> Result<Vec<PushAck>, TransportError> {
        self.check()?;
        self.remote.push(ops)
    }

    fn pull(&mut self, since: Option<u64>, limit: usize) -> Result<PullPage, TransportError> {
        self.check()?;
        self.remote.pull(since, limit)
    }

    fn fetch(&mut self, table: &str, ids: &[RowId]) -> Result<Vec<Row>, TransportError> {
        self.check()?;
        self.remote.fetch(table, ids)
    }

    fn find(&mut self, table: &str, index: &str, key: &FieldValue) -> Result<Vec<Row>, TransportError> {
        self.check()?;
        self.remote.find(table, index, key)
    }
}
