//! Error types for the Hoard engine.

use crate::{RecordId, TableName, Version};
use thiserror::Error;

/// All possible errors from the Hoard engine.
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Sync errors
    #[error("record not found: {table}/{id}")]
    RecordNotFound { table: TableName, id: RecordId },

    #[error("queue entry not found: {0}")]
    QueueEntryNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("version mismatch: expected {expected:?}, got {actual:?}")]
    Precondition {
        expected: Option<Version>,
        actual: Option<Version>,
    },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("strategy '{strategy}' failed: {reason}")]
    Strategy { strategy: String, reason: String },
}

impl Error {
    /// Whether the error comes from payload or schema validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::TableNotFound(_)
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
        )
    }

    /// Whether the error comes from the local transactional storage.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::LockPoisoned)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
