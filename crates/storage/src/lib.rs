pub mod error;
mod outbox;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use sqlite::{OUTBOX_TABLE, SYNC_META_TABLE, SqliteStorage, StoreTx};
pub use traits::*;
