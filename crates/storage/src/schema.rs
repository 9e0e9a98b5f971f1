use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS rows (
    row_id BLOB PRIMARY KEY CHECK (length(row_id) = 16),
    table_name TEXT NOT NULL,
    owner_key TEXT NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at BLOB NOT NULL CHECK (length(created_at) = 12),
    updated_at BLOB NOT NULL CHECK (length(updated_at) = 12),
    deleted_at BLOB CHECK (deleted_at IS NULL OR length(deleted_at) = 12)
);
CREATE INDEX IF NOT EXISTS idx_rows_table_order ON rows (table_name, sort_order, row_id);

CREATE TABLE IF NOT EXISTS fields (
    row_id BLOB NOT NULL CHECK (length(row_id) = 16),
    field_key TEXT NOT NULL,
    value BLOB NOT NULL,
    updated_at BLOB NOT NULL CHECK (length(updated_at) = 12),
    PRIMARY KEY (row_id, field_key)
);
CREATE INDEX IF NOT EXISTS idx_fields_lookup ON fields (field_key, value);

CREATE TABLE IF NOT EXISTS outbox (
    op_id BLOB PRIMARY KEY CHECK (length(op_id) = 16),
    seq INTEGER NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    entity_id BLOB NOT NULL CHECK (length(entity_id) = 16),
    kind TEXT NOT NULL,
    field_key TEXT,
    payload BLOB NOT NULL,
    base_version BLOB CHECK (base_version IS NULL OR length(base_version) = 12),
    enqueued_at BLOB NOT NULL CHECK (length(enqueued_at) = 12),
    attempts INTEGER NOT NULL DEFAULT 0,
    pushed_stamp BLOB CHECK (pushed_stamp IS NULL OR length(pushed_stamp) = 12)
);
CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox (entity_id, kind, field_key);

CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS local_writes (
    table_name TEXT NOT NULL,
    row_id BLOB NOT NULL CHECK (length(row_id) = 16),
    context_id BLOB NOT NULL CHECK (length(context_id) = 16),
    written_ms INTEGER NOT NULL,
    PRIMARY KEY (table_name, row_id)
);

CREATE TABLE IF NOT EXISTS deferred_pulls (
    row_id BLOB PRIMARY KEY CHECK (length(row_id) = 16),
    table_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS divergence (
    row_id BLOB PRIMARY KEY CHECK (length(row_id) = 16),
    table_name TEXT NOT NULL,
    detected_at BLOB NOT NULL CHECK (length(detected_at) = 12)
);
";
