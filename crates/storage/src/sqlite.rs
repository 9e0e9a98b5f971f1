use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use tidepool_core::{ContextId, FieldValue, Hlc, Mutation, ORDER_FIELD, OpId, Row, RowId};

use crate::error::StorageError;
use crate::outbox;
use crate::traits::Store;

/// Pseudo-table covering the outbox.
pub const OUTBOX_TABLE: &str = "outbox";
/// Pseudo-table covering the pull cursor, context announcements and divergence flags.
pub const SYNC_META_TABLE: &str = "sync_meta";

/// Convert Vec<u8> to fixed-size array with proper error handling.
pub(crate) fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub(crate) fn hlc_from(v: Vec<u8>, label: &str) -> Result<Hlc, StorageError> {
    Ok(Hlc::from_bytes(&to_array::<12>(v, label)?))
}

pub(crate) fn row_id_from(v: Vec<u8>, label: &str) -> Result<RowId, StorageError> {
    Ok(RowId::from_bytes(to_array::<16>(v, label)?))
}

/// The durable Local Store. All writes go through [`SqliteStorage::transaction`].
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run `f` inside one transaction scoped to `tables`.
    ///
    /// Either every write made through the [`StoreTx`] becomes visible or, if
    /// `f` returns an error, none does. Writes to tables outside `tables` fail.
    pub fn transaction<R, E, F>(&mut self, tables: &[&str], f: F) -> Result<R, E>
    where
        E: From<StorageError>,
        F: FnOnce(&mut StoreTx<'_>) -> Result<R, E>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let mut store_tx = StoreTx {
            tx,
            scope: tables.iter().map(|t| t.to_string()).collect(),
        };

        match f(&mut store_tx) {
            Ok(out) => {
                store_tx.tx.commit().map_err(StorageError::from)?;
                Ok(out)
            }
            Err(e) => {
                debug!(scope = ?store_tx.scope, "rolling back transaction");
                // Dropping the transaction rolls it back.
                drop(store_tx);
                Err(e)
            }
        }
    }
}

impl Store for SqliteStorage {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// A write handle valid for the duration of one [`SqliteStorage::transaction`].
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
    scope: Vec<String>,
}

impl Store for StoreTx<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl StoreTx<'_> {
    fn check_scope(&self, table: &str) -> Result<(), StorageError> {
        if self.scope.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(StorageError::OutOfScope {
                table: table.to_string(),
            })
        }
    }

    /// Insert or fully replace a row, including all of its field values.
    pub fn put_row(&mut self, row: &Row) -> Result<(), StorageError> {
        self.check_scope(&row.table)?;
        write_row(&self.tx, row)
    }

    /// Append a mutation to the outbox, assigning its `seq`.
    pub fn insert_mutation(&mut self, mutation: &mut Mutation) -> Result<(), StorageError> {
        self.check_scope(OUTBOX_TABLE)?;
        mutation.seq = outbox::insert(&self.tx, mutation)?;
        Ok(())
    }

    /// Replace a pending mutation in place, keeping its `seq`.
    pub fn update_mutation(&mut self, mutation: &Mutation) -> Result<(), StorageError> {
        self.check_scope(OUTBOX_TABLE)?;
        outbox::update(&self.tx, mutation)
    }

    pub fn remove_mutation(&mut self, op_id: OpId) -> Result<bool, StorageError> {
        self.check_scope(OUTBOX_TABLE)?;
        outbox::remove(&self.tx, op_id)
    }

    pub fn set_cursor(&mut self, cursor: u64) -> Result<(), StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        self.tx.execute(
            "INSERT INTO sync_state (key, value) VALUES ('pull_cursor', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![cursor as i64],
        )?;
        Ok(())
    }

    pub fn announce_write(
        &mut self,
        table: &str,
        id: RowId,
        context_id: ContextId,
        written_ms: u64,
    ) -> Result<(), StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        self.tx.execute(
            "INSERT INTO local_writes (table_name, row_id, context_id, written_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(table_name, row_id) DO UPDATE SET context_id = excluded.context_id, written_ms = excluded.written_ms
             WHERE excluded.written_ms >= local_writes.written_ms",
            rusqlite::params![
                table,
                id.as_bytes().as_slice(),
                context_id.as_bytes().as_slice(),
                written_ms as i64,
            ],
        )?;
        Ok(())
    }

    /// Drop announcements older than `before_ms` whose entity has nothing left in the outbox.
    pub fn prune_local_writes(&mut self, before_ms: u64) -> Result<usize, StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        let n = self.tx.execute(
            "DELETE FROM local_writes WHERE written_ms < ?1
             AND NOT EXISTS (SELECT 1 FROM outbox o WHERE o.entity_id = local_writes.row_id)",
            rusqlite::params![before_ms as i64],
        )?;
        Ok(n)
    }

    /// Remember a pulled row that was suppressed so it is fetched again later.
    pub fn defer_pull(&mut self, table: &str, id: RowId) -> Result<(), StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        self.tx.execute(
            "INSERT OR IGNORE INTO deferred_pulls (row_id, table_name) VALUES (?1, ?2)",
            rusqlite::params![id.as_bytes().as_slice(), table],
        )?;
        Ok(())
    }

    pub fn clear_deferred_pull(&mut self, id: RowId) -> Result<bool, StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        let n = self.tx.execute(
            "DELETE FROM deferred_pulls WHERE row_id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }

    pub fn mark_divergence(&mut self, table: &str, id: RowId, at: Hlc) -> Result<(), StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        self.tx.execute(
            "INSERT OR IGNORE INTO divergence (row_id, table_name, detected_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id.as_bytes().as_slice(), table, &at.to_bytes()[..]],
        )?;
        Ok(())
    }

    pub fn clear_divergence(&mut self, id: RowId) -> Result<bool, StorageError> {
        self.check_scope(SYNC_META_TABLE)?;
        let n = self.tx.execute(
            "DELETE FROM divergence WHERE row_id = ?1",
            rusqlite::params![id.as_bytes().as_slice()],
        )?;
        Ok(n > 0)
    }
}

fn write_row(conn: &Connection, row: &Row) -> Result<(), StorageError> {
    let id = row.id.as_bytes().as_slice();

    let existing_table: Option<String> = conn
        .query_row(
            "SELECT table_name FROM rows WHERE row_id = ?1",
            rusqlite::params![id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing) = existing_table
        && existing != row.table
    {
        return Err(StorageError::ConstraintViolation(format!(
            "row {} belongs to {existing}, not {}",
            row.id, row.table
        )));
    }

    conn.execute(
        "INSERT INTO rows (row_id, table_name, owner_key, sort_order, created_at, updated_at, deleted_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(row_id) DO UPDATE SET owner_key = excluded.owner_key, sort_order = excluded.sort_order,
             created_at = excluded.created_at, updated_at = excluded.updated_at, deleted_at = excluded.deleted_at",
        rusqlite::params![
            id,
            row.table,
            row.owner_key,
            row.order,
            &row.created_at.to_bytes()[..],
            &row.updated_at.to_bytes()[..],
            row.deleted_at.map(|h| h.to_bytes().to_vec()),
        ],
    )?;

    conn.execute("DELETE FROM fields WHERE row_id = ?1", rusqlite::params![id])?;
    let mut insert = conn.prepare_cached(
        "INSERT INTO fields (row_id, field_key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (key, value) in &row.fields {
        insert.execute(rusqlite::params![
            id,
            key,
            value.to_msgpack()?,
            &row.field_version(key).to_bytes()[..],
        ])?;
    }
    // The order column keeps its own version so reorders merge per field.
    if let Some(version) = row.field_versions.get(ORDER_FIELD) {
        insert.execute(rusqlite::params![
            id,
            ORDER_FIELD,
            FieldValue::Integer(row.order).to_msgpack()?,
            &version.to_bytes()[..],
        ])?;
    }
    Ok(())
}

pub(crate) fn read_row(conn: &Connection, table: &str, id: RowId) -> Result<Option<Row>, StorageError> {
    let head = conn
        .query_row(
            "SELECT owner_key, sort_order, created_at, updated_at, deleted_at FROM rows WHERE row_id = ?1 AND table_name = ?2",
            rusqlite::params![id.as_bytes().as_slice(), table],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                    r.get::<_, Option<Vec<u8>>>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((owner_key, order, created_at, updated_at, deleted_at)) = head else {
        return Ok(None);
    };

    let mut fields = BTreeMap::new();
    let mut field_versions = BTreeMap::new();
    let mut stmt =
        conn.prepare_cached("SELECT field_key, value, updated_at FROM fields WHERE row_id = ?1")?;
    let rows = stmt.query_map(rusqlite::params![id.as_bytes().as_slice()], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, Vec<u8>>(1)?,
            r.get::<_, Vec<u8>>(2)?,
        ))
    })?;
    for entry in rows {
        let (key, value, version) = entry?;
        field_versions.insert(key.clone(), hlc_from(version, "field updated_at")?);
        if key != ORDER_FIELD {
            fields.insert(key, FieldValue::from_msgpack(&value)?);
        }
    }

    let deleted_at = deleted_at
        .map(|v| hlc_from(v, "deleted_at"))
        .transpose()?;

    Ok(Some(Row {
        id,
        table: table.to_string(),
        owner_key,
        fields,
        field_versions,
        order,
        created_at: hlc_from(created_at, "created_at")?,
        updated_at: hlc_from(updated_at, "updated_at")?,
        deleted: deleted_at.is_some(),
        deleted_at,
    }))
}

fn collect_ids(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<RowId>, StorageError> {
    let raw = stmt
        .query_map(params, |r| r.get::<_, Vec<u8>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(|b| row_id_from(b, "row_id")).collect()
}

pub(crate) fn query_ids(
    conn: &Connection,
    table: &str,
    index: &str,
    key: &FieldValue,
    include_deleted: bool,
) -> Result<Vec<RowId>, StorageError> {
    let sql = format!(
        "SELECT r.row_id FROM rows r JOIN fields f ON f.row_id = r.row_id
         WHERE r.table_name = ?1 AND f.field_key = ?2 AND f.value = ?3 {}
         ORDER BY r.sort_order, r.row_id",
        if include_deleted { "" } else { "AND r.deleted_at IS NULL" }
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    collect_ids(&mut stmt, rusqlite::params![table, index, key.to_msgpack()?])
}

pub(crate) fn list_ids(conn: &Connection, table: &str, include_deleted: bool) -> Result<Vec<RowId>, StorageError> {
    let sql = format!(
        "SELECT row_id FROM rows WHERE table_name = ?1 {} ORDER BY sort_order, row_id",
        if include_deleted { "" } else { "AND deleted_at IS NULL" }
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    collect_ids(&mut stmt, rusqlite::params![table])
}

pub(crate) fn order_bounds(
    conn: &Connection,
    table: &str,
    scope: Option<(&str, &FieldValue)>,
) -> Result<Option<(i64, i64)>, StorageError> {
    let bounds: (Option<i64>, Option<i64>) = match scope {
        Some((field, key)) => conn.query_row(
            "SELECT MIN(r.sort_order), MAX(r.sort_order) FROM rows r JOIN fields f ON f.row_id = r.row_id
             WHERE r.table_name = ?1 AND r.deleted_at IS NULL AND f.field_key = ?2 AND f.value = ?3",
            rusqlite::params![table, field, key.to_msgpack()?],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?,
        None => conn.query_row(
            "SELECT MIN(sort_order), MAX(sort_order) FROM rows WHERE table_name = ?1 AND deleted_at IS NULL",
            rusqlite::params![table],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?,
    };
    Ok(match bounds {
        (Some(min), Some(max)) => Some((min, max)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(table: &str) -> Row {
        let mut row = Row::new(RowId::new(), table, "owner-1", Hlc::new(100, 0));
        row.set_field("title", "Read".into(), Hlc::new(100, 0)).unwrap();
        row
    }

    #[test]
    fn put_and_get_row() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStorage::open_in_memory()?;
        let row = sample_row("goal");
        store.transaction(&["goal"], |tx| tx.put_row(&row))?;

        let loaded = store.get_row("goal", row.id)?.expect("row stored");
        assert_eq!(loaded, row);
        assert!(store.get_row("task", row.id)?.is_none());
        Ok(())
    }

    #[test]
    fn failed_transaction_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStorage::open_in_memory()?;
        let a = sample_row("goal");
        let b = sample_row("goal");

        let result: Result<(), StorageError> = store.transaction(&["goal"], |tx| {
            tx.put_row(&a)?;
            tx.put_row(&b)?;
            Err(StorageError::ConstraintViolation("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.get_row("goal", a.id)?.is_none());
        assert!(store.get_row("goal", b.id)?.is_none());
        Ok(())
    }

    #[test]
    fn writes_outside_scope_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStorage::open_in_memory()?;
        let row = sample_row("task");
        let result = store.transaction(&["goal"], |tx| tx.put_row(&row));
        assert!(matches!(result, Err(StorageError::OutOfScope { .. })));
        Ok(())
    }

    #[test]
    fn query_excludes_tombstones_unless_asked() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStorage::open_in_memory()?;
        let parent = RowId::new();
        let mut live = sample_row("goal");
        live.set_field("list_id", parent.into(), Hlc::new(101, 0))?;
        let mut dead = sample_row("goal");
        dead.set_field("list_id", parent.into(), Hlc::new(101, 0))?;
        dead.tombstone(Hlc::new(102, 0));

        store.transaction(&["goal"], |tx| {
            tx.put_row(&live)?;
            tx.put_row(&dead)
        })?;

        let key = FieldValue::Ref(parent);
        assert_eq!(store.query_rows("goal", "list_id", &key, false)?.len(), 1);
        assert_eq!(store.query_rows("goal", "list_id", &key, true)?.len(), 2);
        Ok(())
    }

    #[test]
    fn deferred_pulls_are_listed_until_cleared() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStorage::open_in_memory()?;
        let (a, b) = (RowId::new(), RowId::new());
        store.transaction(&[SYNC_META_TABLE], |tx| {
            tx.defer_pull("goal", a)?;
            tx.defer_pull("goal", a)?;
            tx.defer_pull("tag", b)
        })?;
        let mut deferred = store.deferred_pulls()?;
        deferred.sort();
        let mut expected = vec![("goal".to_string(), a), ("tag".to_string(), b)];
        expected.sort();
        assert_eq!(deferred, expected);

        let cleared = store.transaction(&[SYNC_META_TABLE], |tx| tx.clear_deferred_pull(a))?;
        assert!(cleared);
        assert_eq!(store.deferred_pulls()?, vec![("tag".to_string(), b)]);
        Ok(())
    }

    #[test]
    fn row_cannot_change_table() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = SqliteStorage::open_in_memory()?;
        let row = sample_row("goal");
        store.transaction(&["goal"], |tx| tx.put_row(&row))?;

        let mut moved = row.clone();
        moved.table = "task".into();
        let result = store.transaction(&["task"], |tx| tx.put_row(&moved));
        assert!(matches!(result, Err(StorageError::ConstraintViolation(_))));
        Ok(())
    }
}
