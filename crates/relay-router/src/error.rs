//! Router error types.

use thiserror::Error;

/// Errors surfaced by router operations.
///
/// These never propagate to a connection reader; the router logs and
/// soft-drops instead.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The target agent has no registered connection.
    #[error("unknown recipient: {recipient} (known: {roster})")]
    UnknownRecipient {
        /// The missing agent.
        recipient: String,
        /// Names currently registered, for the log line.
        roster: String,
    },

    /// The connection id is not registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// The envelope failed the signature gate.
    #[error(transparent)]
    Signature(#[from] relay_signing::SigningError),

    /// The policy gate denied the action.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// The envelope payload was malformed.
    #[error(transparent)]
    Protocol(#[from] relay_protocol::ProtocolError),

    /// The storage layer failed.
    #[error(transparent)]
    Storage(#[from] relay_storage::StorageError),
}

/// A specialized Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
