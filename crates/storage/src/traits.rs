use rusqlite::{Connection, OptionalExtension};

use tidepool_core::{ContextId, FieldValue, Mutation, Row, RowId};

use crate::error::StorageError;
use crate::outbox;
use crate::sqlite::{self, row_id_from, to_array};

/// A context's announcement that it wrote a row locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalWrite {
    pub row_id: RowId,
    pub context_id: ContextId,
    pub written_ms: u64,
}

/// Read access to the Local Store, shared by the store itself and open transactions.
pub trait Store {
    fn conn(&self) -> &Connection;

    fn get_row(&self, table: &str, id: RowId) -> Result<Option<Row>, StorageError> {
        sqlite::read_row(self.conn(), table, id)
    }

    /// Rows of `table` whose `index` field equals `key`, sorted by `(order, id)`.
    fn query_rows(
        &self,
        table: &str,
        index: &str,
        key: &FieldValue,
        include_deleted: bool,
    ) -> Result<Vec<Row>, StorageError> {
        let ids = sqlite::query_ids(self.conn(), table, index, key, include_deleted)?;
        load_rows(self.conn(), table, ids)
    }

    fn list_rows(&self, table: &str, include_deleted: bool) -> Result<Vec<Row>, StorageError> {
        let ids = sqlite::list_ids(self.conn(), table, include_deleted)?;
        load_rows(self.conn(), table, ids)
    }

    /// `(min, max)` order among live rows, optionally restricted to one scope.
    fn order_bounds(
        &self,
        table: &str,
        scope: Option<(&str, &FieldValue)>,
    ) -> Result<Option<(i64, i64)>, StorageError> {
        sqlite::order_bounds(self.conn(), table, scope)
    }

    fn pending_mutations(&self) -> Result<Vec<Mutation>, StorageError> {
        outbox::read_all(self.conn())
    }

    fn pending_for_entity(&self, entity_id: RowId) -> Result<Vec<Mutation>, StorageError> {
        outbox::read_for_entity(self.conn(), entity_id)
    }

    fn outbox_len(&self) -> Result<u64, StorageError> {
        outbox::count(self.conn())
    }

    fn cursor(&self) -> Result<Option<u64>, StorageError> {
        let value: Option<i64> = self
            .conn()
            .query_row(
                "SELECT value FROM sync_state WHERE key = 'pull_cursor'",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    fn local_write(&self, table: &str, id: RowId) -> Result<Option<LocalWrite>, StorageError> {
        let raw: Option<(Vec<u8>, i64)> = self
            .conn()
            .query_row(
                "SELECT context_id, written_ms FROM local_writes WHERE table_name = ?1 AND row_id = ?2",
                rusqlite::params![table, id.as_bytes().as_slice()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        raw.map(|(context, written_ms)| {
            Ok(LocalWrite {
                row_id: id,
                context_id: ContextId::from_bytes(to_array::<16>(context, "context_id")?),
                written_ms: written_ms as u64,
            })
        })
        .transpose()
    }

    /// Suppressed rows still waiting to be fetched again.
    fn deferred_pulls(&self) -> Result<Vec<(String, RowId)>, StorageError> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT table_name, row_id FROM deferred_pulls ORDER BY table_name")?;
        let raw = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(table, id)| Ok((table, row_id_from(id, "row_id")?)))
            .collect()
    }

    fn has_divergence(&self, id: RowId) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM divergence WHERE row_id = ?1",
                rusqlite::params![id.as_bytes().as_slice()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn divergent_rows(&self) -> Result<Vec<(String, RowId)>, StorageError> {
        let mut stmt = self
            .conn()
            .prepare_cached("SELECT table_name, row_id FROM divergence ORDER BY detected_at")?;
        let raw = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(table, id)| Ok((table, row_id_from(id, "row_id")?)))
            .collect()
    }
}

fn load_rows(conn: &Connection, table: &str, ids: Vec<RowId>) -> Result<Vec<Row>, StorageError> {
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = sqlite::read_row(conn, table, id)? {
            rows.push(row);
        }
    }
    Ok(rows)
}
