//! Policy error types.

use thiserror::Error;

/// Errors that can occur while loading or resolving policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A policy file could not be read.
    #[error("policy file i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A policy file could not be parsed.
    #[error("malformed policy file {path}: {message}")]
    Malformed {
        /// The offending file.
        path: String,
        /// Parser message.
        message: String,
    },

    /// The workspace policy provider failed.
    #[error("workspace policy fetch failed: {0}")]
    WorkspaceFetch(String),
}

/// A specialized Result type for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;
