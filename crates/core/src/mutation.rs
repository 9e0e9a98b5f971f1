use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::hlc::Hlc;
use crate::ids::{OpId, RowId};
use crate::row::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Set,
    Increment,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Set => "set",
            Self::Increment => "increment",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "create" => Ok(Self::Create),
            "set" => Ok(Self::Set),
            "increment" => Ok(Self::Increment),
            "delete" => Ok(Self::Delete),
            _ => Err(CoreError::InvalidData(format!("unknown mutation kind: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationPayload {
    /// Full initial state of a row the remote has never seen.
    Create { row: Row },
    Set { field: String, value: FieldValue },
    Increment { field: String, delta: FieldValue },
    Delete { deleted_at: Hlc },
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Create { .. } => MutationKind::Create,
            Self::Set { .. } => MutationKind::Set,
            Self::Increment { .. } => MutationKind::Increment,
            Self::Delete { .. } => MutationKind::Delete,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Set { field, .. } | Self::Increment { field, .. } => Some(field),
            Self::Create { .. } | Self::Delete { .. } => None,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One pending outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub op_id: OpId,
    /// Position in the outbox; assigned by storage, preserved when coalescing in place.
    pub seq: i64,
    pub table: String,
    pub entity_id: RowId,
    pub payload: MutationPayload,
    /// For increments: the local row version the first accumulated delta was applied on top of.
    pub base_version: Option<Hlc>,
    pub enqueued_at: Hlc,
    pub attempts: u32,
    /// For increments: the field version this op wrote remotely on its last attempt.
    pub pushed_stamp: Option<Hlc>,
}

impl Mutation {
    pub fn new(table: &str, entity_id: RowId, payload: MutationPayload, enqueued_at: Hlc) -> Self {
        Self {
            op_id: OpId::new(),
            seq: 0,
            table: table.to_string(),
            entity_id,
            payload,
            base_version: None,
            enqueued_at,
            attempts: 0,
            pushed_stamp: None,
        }
    }

    pub fn with_base_version(mut self, base: Hlc) -> Self {
        self.base_version = Some(base);
        self
    }

    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }

    pub fn field(&self) -> Option<&str> {
        self.payload.field()
    }

    /// Rows that must exist remotely before this op can be applied there.
    pub fn references(&self) -> Vec<RowId> {
        match &self.payload {
            MutationPayload::Create { row } => row.references().collect(),
            MutationPayload::Set { value, .. } => value.as_ref_id().into_iter().collect(),
            MutationPayload::Increment { .. } | MutationPayload::Delete { .. } => Vec::new(),
        }
    }
}
