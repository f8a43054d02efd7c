//! Router-boundary verification policy.

use crate::error::{Result, SigningError};
use crate::key::KeyStore;
use crate::signer::verify_envelope;
use relay_protocol::Envelope;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Verification policy, persisted as `signing.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningConfig {
    /// When true, unsigned envelopes are rejected unless the sender is
    /// allow-listed.
    #[serde(default)]
    pub require_signatures: bool,
    /// Senders whose unsigned envelopes are accepted even when signatures
    /// are required.
    #[serde(default)]
    pub allow_unsigned_from: Vec<String>,
}

impl SigningConfig {
    /// Loads the config from `signing.json` under `dir`, falling back to the
    /// permissive default when the file is absent.
    ///
    /// # Errors
    ///
    /// Fails on I/O or parse errors for a present file.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("signing.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Enforces the verification policy on inbound envelopes before routing.
pub struct SignatureGate {
    config: SigningConfig,
    keys: KeyStore,
}

impl SignatureGate {
    /// Creates a gate from policy and key store.
    #[must_use]
    pub fn new(config: SigningConfig, keys: KeyStore) -> Self {
        Self { config, keys }
    }

    /// Checks an inbound envelope against the policy.
    ///
    /// Unsigned envelopes pass when signatures are not required or the
    /// sender is allow-listed. Signed envelopes must verify against the
    /// sender's stored key.
    ///
    /// # Errors
    ///
    /// Returns the discriminated verification failure; the caller must not
    /// route the envelope.
    pub fn check(&self, envelope: &Envelope) -> Result<()> {
        let sender = envelope.from.as_deref().unwrap_or_default();

        if envelope.sig.is_none() {
            if !self.config.require_signatures
                || self.config.allow_unsigned_from.iter().any(|a| a == sender)
            {
                return Ok(());
            }
            return Err(SigningError::UnsignedRejected(sender.to_string()));
        }

        let key = self
            .keys
            .load(sender)?
            .ok_or_else(|| SigningError::UnknownSigner(sender.to_string()))?;
        verify_envelope(envelope, &key)?;
        debug!(agent = %sender, "envelope signature verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SigningAlgorithm;
    use crate::signer::sign_envelope;
    use relay_protocol::SendPayload;

    fn gate(require: bool, allow: &[&str]) -> (SignatureGate, KeyStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::open(dir.path()).unwrap();
        let gate = SignatureGate::new(
            SigningConfig {
                require_signatures: require,
                allow_unsigned_from: allow.iter().map(ToString::to_string).collect(),
            },
            keys.clone(),
        );
        (gate, keys, dir)
    }

    fn send(from: &str) -> Envelope {
        Envelope::send(from, "bob", None, &SendPayload::message("hi")).unwrap()
    }

    #[test]
    fn unsigned_allowed_when_not_required() {
        let (gate, _keys, _dir) = gate(false, &[]);
        assert!(gate.check(&send("alice")).is_ok());
    }

    #[test]
    fn unsigned_rejected_when_required() {
        let (gate, _keys, _dir) = gate(true, &[]);
        assert!(matches!(
            gate.check(&send("alice")),
            Err(SigningError::UnsignedRejected(_))
        ));
    }

    #[test]
    fn unsigned_allow_list_passes() {
        let (gate, _keys, _dir) = gate(true, &["alice"]);
        assert!(gate.check(&send("alice")).is_ok());
        assert!(gate.check(&send("mallory")).is_err());
    }

    #[test]
    fn signed_envelope_verifies() {
        let (gate, keys, _dir) = gate(true, &[]);
        let key = keys
            .generate("alice", SigningAlgorithm::Ed25519, None)
            .unwrap();

        let mut env = send("alice");
        sign_envelope(&mut env, &key).unwrap();
        assert!(gate.check(&env).is_ok());
    }

    #[test]
    fn signature_from_unknown_signer_rejected() {
        let (gate, _keys, _dir) = gate(false, &[]);
        let foreign = crate::key::AgentKey::generate_hmac("alice", None);

        let mut env = send("alice");
        sign_envelope(&mut env, &foreign).unwrap();
        // Signed, but no key on disk for alice.
        assert!(matches!(
            gate.check(&env),
            Err(SigningError::UnknownSigner(_))
        ));
    }

    #[test]
    fn config_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = SigningConfig::load(dir.path()).unwrap();
        assert!(!config.require_signatures);
        assert!(config.allow_unsigned_from.is_empty());
    }
}
