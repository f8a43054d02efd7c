//! # Relay Signing
//!
//! Cryptographic signing of relay envelopes.
//!
//! Two algorithms are supported: `hmac-sha256` (symmetric, per-agent
//! secret) and `ed25519` (asymmetric; verification needs only the public
//! key). Keys live on disk as `<agent>.key.json`; verification policy is
//! enforced at the router boundary through [`SignatureGate`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod gate;
mod key;
mod signer;

pub use error::{Result, SigningError};
pub use gate::{SignatureGate, SigningConfig};
pub use key::{AgentKey, KeyStore, SigningAlgorithm};
pub use signer::{
    envelope_content, sign_envelope, sign_message, verify_envelope, verify_message,
    MessageSignature,
};
