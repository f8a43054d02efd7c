//! Cloud bridge error types.

use thiserror::Error;

/// Errors from the cloud bridge.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The bridge is not connected; the operation was refused.
    #[error("cloud bridge not connected")]
    NotConnected,

    /// The HTTP request failed.
    #[error("cloud request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The cloud returned a non-success status.
    #[error("cloud responded {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated for logs.
        body: String,
    },

    /// Reading or writing the machine-id file failed.
    #[error("machine id i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;
