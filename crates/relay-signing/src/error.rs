//! Signing error types.

use thiserror::Error;

/// Errors that can occur during signing and verification.
///
/// Verification failures are discriminable so callers can log why an
/// envelope was rejected.
#[derive(Debug, Error)]
pub enum SigningError {
    /// No key is registered for the signer.
    #[error("unknown signer: {0}")]
    UnknownSigner(String),

    /// The signature's signer does not match the expected agent.
    #[error("signer mismatch: signature from {got}, expected {want}")]
    SignerMismatch {
        /// The agent named in the signature.
        got: String,
        /// The agent the envelope claims as sender.
        want: String,
    },

    /// The signature's key id does not match the stored key.
    #[error("key id mismatch for {agent}")]
    KeyIdMismatch {
        /// The agent whose key was checked.
        agent: String,
    },

    /// The key has expired.
    #[error("key expired for {agent}")]
    KeyExpired {
        /// The agent whose key expired.
        agent: String,
    },

    /// The signature algorithm does not match the key.
    #[error("algorithm mismatch: signature is {got}, key is {want}")]
    AlgorithmMismatch {
        /// Algorithm in the signature.
        got: String,
        /// Algorithm of the key.
        want: String,
    },

    /// The signature bytes do not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// The envelope is unsigned but signatures are required.
    #[error("unsigned envelope from {0} rejected")]
    UnsignedRejected(String),

    /// The key is missing the private material needed for this operation.
    #[error("missing private key material for {0}")]
    MissingPrivateKey(String),

    /// Key material could not be decoded.
    #[error("malformed key material: {0}")]
    MalformedKey(String),

    /// Reading or writing a key file failed.
    #[error("key i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file (de)serialization failed.
    #[error("key serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for signing operations.
pub type Result<T> = std::result::Result<T, SigningError>;
