//! Message signing and verification.

use crate::error::{Result, SigningError};
use crate::key::{AgentKey, SigningAlgorithm};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use relay_protocol::{Envelope, WireSignature};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A detached signature over message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSignature {
    /// Hex-encoded signature bytes.
    pub signature: String,
    /// The signer's key id (public key).
    pub key_id: String,
    /// Millisecond timestamp the signature was produced at.
    pub signed_at: u64,
    /// Algorithm used.
    pub algorithm: SigningAlgorithm,
}

impl MessageSignature {
    /// Converts to the compact wire form.
    #[must_use]
    pub fn to_wire(&self) -> WireSignature {
        WireSignature {
            s: self.signature.clone(),
            k: self.key_id.clone(),
            t: self.signed_at,
            a: self.algorithm.to_string(),
        }
    }

    /// Parses the compact wire form.
    ///
    /// # Errors
    ///
    /// Fails when the algorithm name is unknown.
    pub fn from_wire(wire: &WireSignature) -> Result<Self> {
        let algorithm = SigningAlgorithm::parse(&wire.a)
            .ok_or_else(|| SigningError::MalformedKey(format!("unknown algorithm {}", wire.a)))?;
        Ok(Self {
            signature: wire.s.clone(),
            key_id: wire.k.clone(),
            signed_at: wire.t,
            algorithm,
        })
    }
}

/// The canonical signature input. Binding the signer, timestamp, and key id
/// means identical content signed at different times produces different
/// signatures.
#[derive(Serialize)]
struct SignInput<'a> {
    content: &'a str,
    signer: &'a str,
    signed_at: u64,
    key_id: &'a str,
    algorithm: &'a str,
}

fn signing_input(content: &str, signer: &str, signed_at: u64, key: &AgentKey) -> Result<Vec<u8>> {
    let input = SignInput {
        content,
        signer,
        signed_at,
        key_id: &key.public_key,
        algorithm: &key.algorithm.to_string(),
    };
    Ok(serde_json::to_vec(&input)?)
}

/// Signs `content` with the agent's key.
///
/// # Errors
///
/// Fails when the key lacks private material or is malformed.
pub fn sign_message(content: &str, key: &AgentKey) -> Result<MessageSignature> {
    let signed_at = relay_protocol::now_ms();
    let input = signing_input(content, &key.agent_name, signed_at, key)?;
    let secret = key.secret_bytes()?;

    let signature = match key.algorithm {
        SigningAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(&secret)
                .map_err(|e| SigningError::MalformedKey(e.to_string()))?;
            mac.update(&input);
            hex::encode(mac.finalize().into_bytes())
        }
        SigningAlgorithm::Ed25519 => {
            let bytes: [u8; 32] = secret
                .as_slice()
                .try_into()
                .map_err(|_| SigningError::MalformedKey("ed25519 secret must be 32 bytes".into()))?;
            let signing_key = SigningKey::from_bytes(&bytes);
            hex::encode(signing_key.sign(&input).to_bytes())
        }
    };

    Ok(MessageSignature {
        signature,
        key_id: key.public_key.clone(),
        signed_at,
        algorithm: key.algorithm,
    })
}

/// Verifies a signature over `content` claimed by `signer`.
///
/// Checks, in order: signer, key id, key expiry, algorithm, signature.
///
/// # Errors
///
/// Each failed check returns its own [`SigningError`] variant.
pub fn verify_message(
    content: &str,
    signer: &str,
    signature: &MessageSignature,
    key: &AgentKey,
) -> Result<()> {
    if key.agent_name != signer {
        return Err(SigningError::SignerMismatch {
            got: key.agent_name.clone(),
            want: signer.to_string(),
        });
    }
    if signature.key_id != key.public_key {
        return Err(SigningError::KeyIdMismatch {
            agent: signer.to_string(),
        });
    }
    if key.is_expired(relay_protocol::now_ms()) {
        return Err(SigningError::KeyExpired {
            agent: signer.to_string(),
        });
    }
    if signature.algorithm != key.algorithm {
        return Err(SigningError::AlgorithmMismatch {
            got: signature.algorithm.to_string(),
            want: key.algorithm.to_string(),
        });
    }

    let input = signing_input(content, signer, signature.signed_at, key)?;
    let sig_bytes =
        hex::decode(&signature.signature).map_err(|_| SigningError::InvalidSignature)?;

    match key.algorithm {
        SigningAlgorithm::HmacSha256 => {
            let secret = key.secret_bytes()?;
            let mut mac = HmacSha256::new_from_slice(&secret)
                .map_err(|e| SigningError::MalformedKey(e.to_string()))?;
            mac.update(&input);
            mac.verify_slice(&sig_bytes)
                .map_err(|_| SigningError::InvalidSignature)
        }
        SigningAlgorithm::Ed25519 => {
            let public = hex::decode(&key.public_key)
                .map_err(|e| SigningError::MalformedKey(e.to_string()))?;
            let public: [u8; 32] = public
                .as_slice()
                .try_into()
                .map_err(|_| SigningError::MalformedKey("ed25519 public must be 32 bytes".into()))?;
            let verifying_key = VerifyingKey::from_bytes(&public)
                .map_err(|e| SigningError::MalformedKey(e.to_string()))?;
            let sig_bytes: [u8; 64] = sig_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SigningError::InvalidSignature)?;
            verifying_key
                .verify(&input, &Signature::from_bytes(&sig_bytes))
                .map_err(|_| SigningError::InvalidSignature)
        }
    }
}

/// The envelope fields covered by a signature: everything except `_sig`.
#[must_use]
pub fn envelope_content(envelope: &Envelope) -> String {
    let mut unsigned = envelope.clone();
    unsigned.sig = None;
    // Envelope serialization cannot fail: every field is serializable.
    serde_json::to_string(&unsigned).unwrap_or_default()
}

/// Signs an envelope in place, attaching the compact `_sig` side-channel.
///
/// # Errors
///
/// Fails when signing fails; the envelope is unchanged in that case.
pub fn sign_envelope(envelope: &mut Envelope, key: &AgentKey) -> Result<()> {
    let content = envelope_content(envelope);
    let signature = sign_message(&content, key)?;
    envelope.sig = Some(signature.to_wire());
    Ok(())
}

/// Verifies an envelope's `_sig` against the sender's key.
///
/// # Errors
///
/// Fails when the envelope is unsigned or any verification check fails.
pub fn verify_envelope(envelope: &Envelope, key: &AgentKey) -> Result<()> {
    let signer = envelope.from.as_deref().unwrap_or_default();
    let wire = envelope
        .sig
        .as_ref()
        .ok_or_else(|| SigningError::UnsignedRejected(signer.to_string()))?;
    let signature = MessageSignature::from_wire(wire)?;
    verify_message(&envelope_content(envelope), signer, &signature, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::SendPayload;

    #[test]
    fn hmac_sign_verify_roundtrip() {
        let key = AgentKey::generate_hmac("alice", None);
        let sig = sign_message("hello", &key).unwrap();
        assert!(verify_message("hello", "alice", &sig, &key).is_ok());
    }

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let key = AgentKey::generate_ed25519("alice", None);
        let sig = sign_message("hello", &key).unwrap();
        assert!(verify_message("hello", "alice", &sig, &key).is_ok());
    }

    #[test]
    fn ed25519_verifies_without_private_key() {
        let key = AgentKey::generate_ed25519("alice", None);
        let sig = sign_message("hello", &key).unwrap();

        let mut public_only = key.clone();
        public_only.private_key = None;
        assert!(verify_message("hello", "alice", &sig, &public_only).is_ok());
    }

    #[test]
    fn content_tamper_detected() {
        let key = AgentKey::generate_hmac("alice", None);
        let sig = sign_message("hello", &key).unwrap();
        assert!(matches!(
            verify_message("hell0", "alice", &sig, &key),
            Err(SigningError::InvalidSignature)
        ));
    }

    #[test]
    fn signer_tamper_detected() {
        let key = AgentKey::generate_hmac("alice", None);
        let sig = sign_message("hello", &key).unwrap();
        assert!(matches!(
            verify_message("hello", "mallory", &sig, &key),
            Err(SigningError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn expired_key_rejected() {
        let mut key = AgentKey::generate_hmac("alice", None);
        let sig = sign_message("hello", &key).unwrap();
        key.expires_at = Some(1);
        assert!(matches!(
            verify_message("hello", "alice", &sig, &key),
            Err(SigningError::KeyExpired { .. })
        ));
    }

    #[test]
    fn algorithm_mismatch_rejected() {
        let hmac_key = AgentKey::generate_hmac("alice", None);
        let sig = sign_message("hello", &hmac_key).unwrap();

        let mut ed_key = AgentKey::generate_ed25519("alice", None);
        // Same key id so the check under test is the algorithm.
        ed_key.public_key = hmac_key.public_key.clone();
        assert!(matches!(
            verify_message("hello", "alice", &sig, &ed_key),
            Err(SigningError::AlgorithmMismatch { .. })
        ));
    }

    #[test]
    fn signatures_bind_time() {
        let key = AgentKey::generate_hmac("alice", None);
        let a = sign_message("same content", &key).unwrap();
        let mut b = sign_message("same content", &key).unwrap();
        // Force different timestamps to make the property explicit.
        b.signed_at = a.signed_at + 1;
        let input_a = signing_input("same content", "alice", a.signed_at, &key).unwrap();
        let input_b = signing_input("same content", "alice", b.signed_at, &key).unwrap();
        assert_ne!(input_a, input_b);
    }

    #[test]
    fn envelope_sign_verify_roundtrip() {
        let key = AgentKey::generate_ed25519("alice", None);
        let mut env =
            Envelope::send("alice", "bob", None, &SendPayload::message("signed")).unwrap();

        sign_envelope(&mut env, &key).unwrap();
        assert!(env.sig.is_some());
        assert!(verify_envelope(&env, &key).is_ok());

        env.to = Some("mallory".to_string());
        assert!(matches!(
            verify_envelope(&env, &key),
            Err(SigningError::InvalidSignature)
        ));
    }

    #[test]
    fn wire_signature_roundtrip() {
        let key = AgentKey::generate_hmac("alice", None);
        let sig = sign_message("x", &key).unwrap();
        let wire = sig.to_wire();
        assert_eq!(wire.a, "hmac-sha256");
        let back = MessageSignature::from_wire(&wire).unwrap();
        assert_eq!(back, sig);
    }
}
