//! Protocol error types.

use thiserror::Error;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame or envelope is malformed.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The frame exceeds size limits.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// The actual size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// The envelope carries an unsupported protocol version.
    #[error("protocol version mismatch: got {got}, want {want}")]
    VersionMismatch {
        /// The version on the wire.
        got: u32,
        /// The version this daemon speaks.
        want: u32,
    },

    /// The payload does not match the envelope kind.
    #[error("unexpected payload for {kind}: {reason}")]
    UnexpectedPayload {
        /// The envelope kind.
        kind: String,
        /// What was wrong with the payload.
        reason: String,
    },

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
