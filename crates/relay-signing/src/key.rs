//! Agent key material and the on-disk key store.

use crate::error::{Result, SigningError};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// Symmetric HMAC over SHA-256. Fastest; verifier needs the secret.
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
    /// Ed25519 signatures; verification needs only the public key.
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl std::fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningAlgorithm::HmacSha256 => write!(f, "hmac-sha256"),
            SigningAlgorithm::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl SigningAlgorithm {
    /// Parse from the wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hmac-sha256" => Some(SigningAlgorithm::HmacSha256),
            "ed25519" => Some(SigningAlgorithm::Ed25519),
            _ => None,
        }
    }
}

/// An agent's key material, persisted as `<agent>.key.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentKey {
    /// The agent this key belongs to.
    pub agent_name: String,
    /// Signature algorithm.
    pub algorithm: SigningAlgorithm,
    /// Public half: the Ed25519 verifying key, or the HMAC secret's SHA-256.
    /// Doubles as the key id on the wire.
    pub public_key: String,
    /// Private half (hex). Absent for verify-only Ed25519 keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Millisecond timestamp the key was created.
    pub created_at: u64,
    /// Optional millisecond expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl AgentKey {
    /// Generates a fresh HMAC-SHA256 key.
    #[must_use]
    pub fn generate_hmac(agent_name: &str, ttl: Option<Duration>) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *secret);

        let key_id = hex::encode(Sha256::digest(&*secret));
        let now = relay_protocol::now_ms();
        Self {
            agent_name: agent_name.to_string(),
            algorithm: SigningAlgorithm::HmacSha256,
            public_key: key_id,
            private_key: Some(hex::encode(&*secret)),
            created_at: now,
            expires_at: ttl.map(|t| now + t.as_millis() as u64),
        }
    }

    /// Generates a fresh Ed25519 keypair.
    #[must_use]
    pub fn generate_ed25519(agent_name: &str, ttl: Option<Duration>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let now = relay_protocol::now_ms();
        Self {
            agent_name: agent_name.to_string(),
            algorithm: SigningAlgorithm::Ed25519,
            public_key: hex::encode(signing_key.verifying_key().to_bytes()),
            private_key: Some(hex::encode(signing_key.to_bytes())),
            created_at: now,
            expires_at: ttl.map(|t| now + t.as_millis() as u64),
        }
    }

    /// True once the key's expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|exp| now_ms >= exp)
    }

    /// Decodes the private material.
    ///
    /// # Errors
    ///
    /// Fails when the key has no private half or the hex is malformed.
    pub fn secret_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        let private = self
            .private_key
            .as_ref()
            .ok_or_else(|| SigningError::MissingPrivateKey(self.agent_name.clone()))?;
        let bytes =
            hex::decode(private).map_err(|e| SigningError::MalformedKey(e.to_string()))?;
        Ok(Zeroizing::new(bytes))
    }
}

/// Disk-backed store of agent keys.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Creates a key store rooted at `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn key_path(&self, agent_name: &str) -> PathBuf {
        self.dir.join(format!("{agent_name}.key.json"))
    }

    /// Loads an agent's key. Returns `None` for missing or expired keys.
    ///
    /// # Errors
    ///
    /// Fails only on I/O or parse errors; absence and expiry are `Ok(None)`.
    pub fn load(&self, agent_name: &str) -> Result<Option<AgentKey>> {
        let path = self.key_path(agent_name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let key: AgentKey = serde_json::from_str(&raw)?;
        if key.is_expired(relay_protocol::now_ms()) {
            tracing::debug!(agent = %agent_name, "ignoring expired key");
            return Ok(None);
        }
        Ok(Some(key))
    }

    /// Persists a key, replacing any existing file for the agent.
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialization errors.
    pub fn save(&self, key: &AgentKey) -> Result<()> {
        let path = self.key_path(&key.agent_name);
        let json = serde_json::to_string_pretty(key)?;
        std::fs::write(&path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Generates, persists, and returns a fresh key for an agent.
    ///
    /// # Errors
    ///
    /// Fails when the key cannot be written.
    pub fn generate(
        &self,
        agent_name: &str,
        algorithm: SigningAlgorithm,
        ttl: Option<Duration>,
    ) -> Result<AgentKey> {
        let key = match algorithm {
            SigningAlgorithm::HmacSha256 => AgentKey::generate_hmac(agent_name, ttl),
            SigningAlgorithm::Ed25519 => AgentKey::generate_ed25519(agent_name, ttl),
        };
        self.save(&key)?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_wire_names() {
        assert_eq!(SigningAlgorithm::HmacSha256.to_string(), "hmac-sha256");
        assert_eq!(
            SigningAlgorithm::parse("ed25519"),
            Some(SigningAlgorithm::Ed25519)
        );
        assert_eq!(SigningAlgorithm::parse("rot13"), None);
    }

    #[test]
    fn generated_keys_differ() {
        let a = AgentKey::generate_ed25519("alice", None);
        let b = AgentKey::generate_ed25519("alice", None);
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();

        let key = store
            .generate("alice", SigningAlgorithm::HmacSha256, None)
            .unwrap();
        let loaded = store.load("alice").unwrap().unwrap();
        assert_eq!(loaded.public_key, key.public_key);
        assert_eq!(loaded.algorithm, SigningAlgorithm::HmacSha256);
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        assert!(store.load("nobody").unwrap().is_none());
    }

    #[test]
    fn expired_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();

        let mut key = AgentKey::generate_hmac("alice", None);
        key.expires_at = Some(1);
        store.save(&key).unwrap();

        assert!(store.load("alice").unwrap().is_none());
    }

    #[test]
    fn key_file_is_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        store
            .generate("bob", SigningAlgorithm::Ed25519, None)
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("bob.key.json")).unwrap();
        assert!(raw.contains("\"agentName\""));
        assert!(raw.contains("\"publicKey\""));
    }
}
