use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::RowId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(i64),
    Ref(RowId),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl From<RowId> for FieldValue {
    fn from(id: RowId) -> Self {
        Self::Ref(id)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(n) => Some(*n),
            FieldValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<RowId> {
        match self {
            FieldValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this value can act as a counter delta or counter base.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldValue::Integer(_) | FieldValue::Float(_))
    }

    /// Additive merge used by counter fields. A missing or null base counts as zero.
    pub fn add(base: Option<&FieldValue>, delta: &FieldValue) -> Result<FieldValue, CoreError> {
        match (base.unwrap_or(&FieldValue::Null), delta) {
            (FieldValue::Null, FieldValue::Integer(d)) => Ok(FieldValue::Integer(*d)),
            (FieldValue::Null, FieldValue::Float(d)) => Ok(FieldValue::Float(*d)),
            (FieldValue::Integer(a), FieldValue::Integer(d)) => a
                .checked_add(*d)
                .map(FieldValue::Integer)
                .ok_or_else(|| CoreError::InvalidData("counter overflow".into())),
            (FieldValue::Integer(a), FieldValue::Float(d)) => Ok(FieldValue::Float(*a as f64 + d)),
            (FieldValue::Float(a), FieldValue::Integer(d)) => Ok(FieldValue::Float(a + *d as f64)),
            (FieldValue::Float(a), FieldValue::Float(d)) => Ok(FieldValue::Float(a + d)),
            (base, delta) => Err(CoreError::InvalidMutation(format!(
                "cannot add {delta:?} to {base:?}"
            ))),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
