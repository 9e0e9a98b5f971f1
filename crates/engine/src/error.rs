use tidepool_core::CoreError;
use tidepool_storage::StorageError;
use thiserror::Error;

use crate::remote::TransportError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("row not found: {table}/{id}")]
    RowNotFound { table: String, id: String },

    #[error("row already deleted: {table}/{id}")]
    RowDeleted { table: String, id: String },

    #[error("row already exists: {table}/{id}")]
    RowExists { table: String, id: String },

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn not_found(table: &str, id: impl ToString) -> Self {
        Self::RowNotFound {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn deleted(table: &str, id: impl ToString) -> Self {
        Self::RowDeleted {
            table: table.to_string(),
            id: id.to_string(),
        }
    }
}
