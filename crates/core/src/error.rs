use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("HLC drift too large: remote is {delta_ms}ms ahead (max {max_ms}ms)")]
    HlcDriftTooLarge { delta_ms: u64, max_ms: u64 },

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
