use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const DEFAULT_CONFIG_NAME: &str = "tidepool.json";

/// Tunables for one engine instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Stamped on every row this replica creates.
    pub owner_key: String,
    /// Quiet period after the last local write before a push starts.
    pub debounce_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long after a local write a same-moment remote snapshot is ignored.
    pub grace_window_ms: u64,
    pub push_batch_size: usize,
    pub pull_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            owner_key: "local".to_string(),
            debounce_ms: 250,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            grace_window_ms: 2_000,
            push_batch_size: 256,
            pull_page_size: 500,
        }
    }
}

impl EngineConfig {
    pub fn for_owner(owner_key: impl Into<String>) -> Self {
        Self {
            owner_key: owner_key.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.owner_key.is_empty() {
            return Err(EngineError::Config("owner_key must not be empty".into()));
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            return Err(EngineError::Config(
                "backoff_max_ms must be at least backoff_base_ms, which must be positive".into(),
            ));
        }
        if self.push_batch_size == 0 || self.pull_page_size == 0 {
            return Err(EngineError::Config("batch sizes must be positive".into()));
        }
        Ok(())
    }

    /// Read `tidepool.json` from `base_dir`, writing the defaults there first if it is missing.
    pub fn load_or_init(base_dir: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(base_dir)
            .map_err(|err| EngineError::Config(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| EngineError::Config(format!("read config: {err}")))?;
            let config: EngineConfig =
                serde_json::from_str(&raw).map_err(|err| EngineError::Config(err.to_string()))?;
            config.validate()?;
            return Ok(config);
        }
        let default = EngineConfig::default();
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| EngineError::Config(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| EngineError::Config(format!("write config: {err}")))?;
        Ok(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_writes_defaults_then_reads_them_back() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let first = EngineConfig::load_or_init(dir.path())?;
        assert_eq!(first, EngineConfig::default());
        assert!(dir.path().join(DEFAULT_CONFIG_NAME).exists());

        fs::write(
            dir.path().join(DEFAULT_CONFIG_NAME),
            r#"{ "owner_key": "user-7", "debounce_ms": 50 }"#,
        )?;
        let second = EngineConfig::load_or_init(dir.path())?;
        assert_eq!(second.owner_key, "user-7");
        assert_eq!(second.debounce_ms, 50);
        assert_eq!(second.grace_window_ms, EngineConfig::default().grace_window_ms);
        Ok(())
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let config = EngineConfig {
            backoff_base_ms: 500,
            backoff_max_ms: 100,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
