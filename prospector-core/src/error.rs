use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ProspectorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Lease expired or lost for task {dedup_key}")]
    LeaseExpired { dedup_key: String },

    #[error("Stage {stage} failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("Trigger {trigger} is not valid from state {state}")]
    InvalidTransition { state: String, trigger: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Compaction of {campaign} already running (held by {owner})")]
    CompactionLocked { campaign: String, owner: String },

    #[error("Invalid tile id: {0}")]
    InvalidTileId(String),

    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProspectorError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProspectorError::Storage(err) => err.is_transient(),
            ProspectorError::CompactionLocked { .. } => true,
            _ => false,
        }
    }
}

impl From<toml::de::Error> for ProspectorError {
    fn from(err: toml::de::Error) -> Self {
        ProspectorError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for ProspectorError {
    fn from(err: toml::ser::Error) -> Self {
        ProspectorError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProspectorError>;
