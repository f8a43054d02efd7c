//! Node error types.

use thiserror::Error;

/// Errors from daemon and orchestrator operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration problem.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem or socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] relay_storage::StorageError),

    /// Signing subsystem failure.
    #[error(transparent)]
    Signing(#[from] relay_signing::SigningError),

    /// Policy subsystem failure.
    #[error(transparent)]
    Policy(#[from] relay_policy::PolicyError),

    /// Router failure.
    #[error(transparent)]
    Router(#[from] relay_router::RouterError),

    /// Cloud bridge failure.
    #[error(transparent)]
    Cloud(#[from] relay_cloud::CloudError),

    /// The referenced workspace does not exist.
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),

    /// Roster (de)serialization failed.
    #[error("roster serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
