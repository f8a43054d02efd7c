//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(String),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A status update would move backwards.
    #[error("status regression: {id} is {current}, refusing {requested}")]
    StatusRegression {
        /// Message id.
        id: String,
        /// Current status.
        current: String,
        /// The rejected status.
        requested: String,
    },

    /// The store has been closed.
    #[error("store closed")]
    Closed,

    /// Serialization of a stored field failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database integrity check failed at open.
    #[error("integrity check failed: {0}")]
    IntegrityCheck(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
