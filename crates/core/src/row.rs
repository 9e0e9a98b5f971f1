use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::FieldValue;
use crate::hlc::Hlc;
use crate::ids::RowId;

/// Reserved field key addressing a row's list position.
pub const ORDER_FIELD: &str = "order";

/// An entity row as stored locally and exchanged with the remote authority.
///
/// A row is either live or a tombstone. Tombstones keep every field value so
/// late-arriving merges still have something to compare against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub table: String,
    pub owner_key: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Last-write stamp per field; drives field-level last-write-wins.
    pub field_versions: BTreeMap<String, Hlc>,
    pub order: i64,
    pub created_at: Hlc,
    pub updated_at: Hlc,
    pub deleted: bool,
    pub deleted_at: Option<Hlc>,
}

impl Row {
    pub fn new(id: RowId, table: &str, owner_key: &str, stamp: Hlc) -> Self {
        Self {
            id,
            table: table.to_string(),
            owner_key: owner_key.to_string(),
            fields: BTreeMap::new(),
            field_versions: BTreeMap::new(),
            order: 0,
            created_at: stamp,
            updated_at: stamp,
            deleted: false,
            deleted_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// The stamp of the last write to `key`, or `created_at` if it was never written.
    pub fn field_version(&self, key: &str) -> Hlc {
        self.field_versions
            .get(key)
            .copied()
            .unwrap_or(self.created_at)
    }

    /// Current value of `key`, treating the order column as a field.
    pub fn value_of(&self, key: &str) -> Option<FieldValue> {
        if key == ORDER_FIELD {
            return Some(FieldValue::Integer(self.order));
        }
        self.fields.get(key).cloned()
    }

    pub fn set_field(&mut self, key: &str, value: FieldValue, stamp: Hlc) -> Result<(), CoreError> {
        if key == ORDER_FIELD {
            self.order = value.as_integer().ok_or_else(|| {
                CoreError::InvalidMutation(format!("order must be an integer, got {value:?}"))
            })?;
        } else {
            self.fields.insert(key.to_string(), value);
        }
        self.field_versions.insert(key.to_string(), stamp);
        self.touch(stamp);
        Ok(())
    }

    pub fn tombstone(&mut self, stamp: Hlc) {
        self.deleted = true;
        self.deleted_at = Some(stamp);
        self.touch(stamp);
    }

    fn touch(&mut self, stamp: Hlc) {
        if stamp > self.updated_at {
            self.updated_at = stamp;
        }
    }

    /// Ids of rows this row points at through `Ref` fields.
    pub fn references(&self) -> impl Iterator<Item = RowId> + '_ {
        self.fields.values().filter_map(FieldValue::as_ref_id)
    }

    /// Structural checks applied to rows received from outside this replica.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.table.is_empty() {
            return Err(CoreError::InvalidData(format!("row {} has no table", self.id)));
        }
        if self.deleted != self.deleted_at.is_some() {
            return Err(CoreError::InvalidData(format!(
                "row {} has inconsistent tombstone state",
                self.id
            )));
        }
        if self.updated_at < self.created_at {
            return Err(CoreError::InvalidData(format!(
                "row {} updated before it was created",
                self.id
            )));
        }
        if let Some((key, _)) = self.field_versions.iter().find(|(_, v)| **v > self.updated_at) {
            return Err(CoreError::InvalidData(format!(
                "row {} field {key} is newer than the row",
                self.id
            )));
        }
        Ok(())
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
