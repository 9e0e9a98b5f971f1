use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use tidepool_core::{FieldValue, Hlc, OpId, Row, RowId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// What the remote should do for one outbox entry, after conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum PushAction {
    Create(Row),
    SetFields {
        fields: BTreeMap<String, FieldValue>,
        stamp: Hlc,
    },
    /// Compare-and-set of a counter: applies only while the remote field
    /// version still equals `expected`.
    WriteCounter {
        field: String,
        value: FieldValue,
        expected: Hlc,
        stamp: Hlc,
    },
    Tombstone {
        deleted_at: Hlc,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushOp {
    pub op_id: OpId,
    pub table: String,
    pub id: RowId,
    pub action: PushAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAck {
    Applied,
    /// The op_id was applied by an earlier attempt.
    Duplicate,
    /// A counter compare-and-set lost a race; re-fetch and recompute.
    Stale,
    Rejected(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullPage {
    pub rows: Vec<Row>,
    pub cursor: u64,
}

/// The remote authority every replica synchronizes through.
pub trait RemoteBackend: Send {
    /// Apply `ops` in order, returning one acknowledgement per op.
    fn push(&mut self, ops: &[PushOp]) -> Result<Vec<PushAck>, TransportError>;

    /// Row snapshots changed after `since`, oldest change first.
    fn pull(&mut self, since: Option<u64>, limit: usize) -> Result<PullPage, TransportError>;

    fn fetch(&mut self, table: &str, ids: &[RowId]) -> Result<Vec<Row>, TransportError>;

    fn find(&mut self, table: &str, index: &str, key: &FieldValue) -> Result<Vec<Row>, TransportError>;
}

/// Cancels in-flight network work when the owning context goes away.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_cancelled() {
            Err(TransportError::Cancelled)
        } else {
            Ok(())
        }
    }
}
