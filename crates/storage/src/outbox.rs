use rusqlite::Connection;

use tidepool_core::{Mutation, MutationKind, MutationPayload, OpId, RowId};

use crate::error::StorageError;
use crate::sqlite::{hlc_from, row_id_from, to_array};

const SELECT_COLUMNS: &str = "SELECT op_id, seq, table_name, entity_id, kind, payload, base_version, enqueued_at, attempts, pushed_stamp FROM outbox";

type RawMutation = (
    Vec<u8>,
    i64,
    String,
    Vec<u8>,
    String,
    Vec<u8>,
    Option<Vec<u8>>,
    Vec<u8>,
    i64,
    Option<Vec<u8>>,
);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMutation> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode(raw: RawMutation) -> Result<Mutation, StorageError> {
    let (op_id, seq, table, entity_id, kind, payload, base_version, enqueued_at, attempts, pushed_stamp) =
        raw;
    let payload = MutationPayload::from_msgpack(&payload)?;
    let kind = MutationKind::parse(&kind)?;
    if payload.kind() != kind {
        return Err(StorageError::Serialization(format!(
            "outbox kind {} does not match payload {}",
            kind.as_str(),
            payload.kind().as_str()
        )));
    }
    Ok(Mutation {
        op_id: OpId::from_bytes(to_array::<16>(op_id, "op_id")?),
        seq,
        table,
        entity_id: row_id_from(entity_id, "entity_id")?,
        payload,
        base_version: base_version.map(|v| hlc_from(v, "base_version")).transpose()?,
        enqueued_at: hlc_from(enqueued_at, "enqueued_at")?,
        attempts: attempts as u32,
        pushed_stamp: pushed_stamp.map(|v| hlc_from(v, "pushed_stamp")).transpose()?,
    })
}

fn read_many(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Mutation>, StorageError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let raw = stmt
        .query_map(params, read_raw)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(decode).collect()
}

pub(crate) fn read_all(conn: &Connection) -> Result<Vec<Mutation>, StorageError> {
    read_many(conn, &format!("{SELECT_COLUMNS} ORDER BY seq"), [])
}

pub(crate) fn read_for_entity(conn: &Connection, entity_id: RowId) -> Result<Vec<Mutation>, StorageError> {
    read_many(
        conn,
        &format!("{SELECT_COLUMNS} WHERE entity_id = ?1 ORDER BY seq"),
        rusqlite::params![entity_id.as_bytes().as_slice()],
    )
}

pub(crate) fn count(conn: &Connection) -> Result<u64, StorageError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
    Ok(n as u64)
}

pub(crate) fn insert(conn: &Connection, m: &Mutation) -> Result<i64, StorageError> {
    let seq: i64 = conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM outbox", [], |r| r.get(0))?;
    conn.execute(
        "INSERT INTO outbox (op_id, seq, table_name, entity_id, kind, field_key, payload, base_version, enqueued_at, attempts, pushed_stamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            m.op_id.as_bytes().as_slice(),
            seq,
            m.table,
            m.entity_id.as_bytes().as_slice(),
            m.kind().as_str(),
            m.field(),
            m.payload.to_msgpack()?,
            m.base_version.map(|h| h.to_bytes().to_vec()),
            &m.enqueued_at.to_bytes()[..],
            m.attempts as i64,
            m.pushed_stamp.map(|h| h.to_bytes().to_vec()),
        ],
    )?;
    Ok(seq)
}

pub(crate) fn update(conn: &Connection, m: &Mutation) -> Result<(), StorageError> {
    let n = conn.execute(
        "UPDATE outbox SET kind = ?2, field_key = ?3, payload = ?4, base_version = ?5, enqueued_at = ?6, attempts = ?7, pushed_stamp = ?8
         WHERE op_id = ?1",
        rusqlite::params![
            m.op_id.as_bytes().as_slice(),
            m.kind().as_str(),
            m.field(),
            m.payload.to_msgpack()?,
            m.base_version.map(|h| h.to_bytes().to_vec()),
            &m.enqueued_at.to_bytes()[..],
            m.attempts as i64,
            m.pushed_stamp.map(|h| h.to_bytes().to_vec()),
        ],
    )?;
    if n == 0 {
        return Err(StorageError::NotFound(format!("outbox entry {}", m.op_id)));
    }
    Ok(())
}

pub(crate) fn remove(conn: &Connection, op_id: OpId) -> Result<bool, StorageError> {
    let n = conn.execute(
        "DELETE FROM outbox WHERE op_id = ?1",
        rusqlite::params![op_id.as_bytes().as_slice()],
    )?;
    Ok(n > 0)
}

