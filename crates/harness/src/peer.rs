use std::path::Path;
use std::sync::Arc;

use tidepool_core::hlc::ManualTime;
use tidepool_core::{FieldValue, Row, RowId};
use tidepool_engine::{Engine, EngineConfig, EngineError, PullReport, PushReport};
use tidepool_storage::SqliteStorage;

use crate::remote::{MemoryRemote, RemoteLink};
use crate::schema::Table;

/// One replica: an engine over its own Local Store, linked to the shared remote.
pub struct TestPeer {
    pub engine: Engine<Table>,
    pub link: RemoteLink,
    pub time: ManualTime,
}

impl TestPeer {
    pub fn new(owner_key: &str, remote: &MemoryRemote, time: &ManualTime) -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::for_owner(owner_key), remote, time)
    }

    /// An in-memory replica with non-default tunables.
    pub fn with_config(config: EngineConfig, remote: &MemoryRemote, time: &ManualTime) -> Result<Self, EngineError> {
        Self::with_storage(config, SqliteStorage::open_in_memory()?, remote, time)
    }

    /// A context over a file-backed store, so several peers can share it.
    pub fn open(
        owner_key: &str,
        path: &Path,
        remote: &MemoryRemote,
        time: &ManualTime,
    ) -> Result<Self, EngineError> {
        Self::with_storage(EngineConfig::for_owner(owner_key), SqliteStorage::open(path)?, remote, time)
    }

    fn with_storage(
        config: EngineConfig,
        storage: SqliteStorage,
        remote: &MemoryRemote,
        time: &ManualTime,
    ) -> Result<Self, EngineError> {
        let mut engine = Engine::new(config, storage, Arc::new(time.clone()))?;
        let link = RemoteLink::new(remote.clone());
        engine.attach_remote(link.clone());
        Ok(Self {
            engine,
            link,
            time: time.clone(),
        })
    }

    pub fn go_offline(&self) {
        self.link.set_online(false);
    }

    pub fn go_online(&self) {
        self.link.set_online(true);
    }

    /// Push everything pending, then pull until caught up.
    pub fn sync(&mut self) -> Result<(PushReport, PullReport), EngineError> {
        let pushed = self.engine.flush()?;
        let pulled = self.engine.pull()?;
        Ok((pushed, pulled))
    }

    pub fn create(&mut self, table: Table, fields: Vec<(&str, FieldValue)>) -> Result<RowId, EngineError> {
        Ok(self.engine.create(table, fields)?.id)
    }

    pub fn field(&self, table: Table, id: RowId, key: &str) -> Result<Option<FieldValue>, EngineError> {
        Ok(self
            .engine
            .get(table, id)?
            .and_then(|row| row.field(key).cloned()))
    }

    pub fn row(&self, table: Table, id: RowId) -> Result<Option<Row>, EngineError> {
        self.engine.get_with_deleted(table, id)
    }
}
