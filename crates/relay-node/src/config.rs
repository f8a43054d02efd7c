//! Daemon configuration.
//!
//! Environment variables consumed:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `AGENT_RELAY_DATA_DIR` | Data directory | `./data` |
//! | `AGENT_RELAY_CONFIG_DIR` | User config directory | `$XDG_CONFIG_HOME/agent-relay` |
//! | `AGENT_RELAY_STORAGE_TYPE` | `memory` or `sqlite` | `sqlite` |
//! | `AGENT_RELAY_STORAGE_PATH` | SQLite file path | `<data_dir>/messages.db` |
//! | `AGENT_RELAY_STORAGE_URL` | Reserved for remote stores | unset |
//! | `AGENT_RELAY_CLOUD_URL` | Cloud bridge base URL | unset (bridge off) |
//! | `AGENT_RELAY_API_KEY` | Cloud API key | unset |
//! | `XDG_CONFIG_HOME` | Config-dir fallback root | `~/.config` |

use crate::error::{NodeError, Result};
use std::path::PathBuf;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    /// Bounded in-memory store.
    Memory,
    /// Batched SQLite store.
    #[default]
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Which adapter to use.
    pub storage_type: StorageType,
    /// SQLite file path override.
    pub path: Option<PathBuf>,
    /// Reserved for remote stores; accepted but unused by the shipped
    /// adapters.
    pub url: Option<String>,
}

/// Cloud bridge configuration; present only when a cloud URL is set.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Cloud base URL.
    pub url: String,
    /// API key.
    pub api_key: String,
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Data directory (store, machine id, keys, signing config).
    pub data_dir: PathBuf,
    /// User config directory (policy files).
    pub config_dir: PathBuf,
    /// Storage selection.
    pub storage: StorageConfig,
    /// Cloud bridge, when configured.
    pub cloud: Option<CloudConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            config_dir: default_config_dir(),
            storage: StorageConfig::default(),
            cloud: None,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Fails on unparseable values (unknown storage type).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("AGENT_RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("AGENT_RELAY_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }

        if let Ok(storage_type) = std::env::var("AGENT_RELAY_STORAGE_TYPE") {
            config.storage.storage_type = match storage_type.to_lowercase().as_str() {
                "memory" => StorageType::Memory,
                "sqlite" => StorageType::Sqlite,
                other => {
                    return Err(NodeError::Config(format!(
                        "unknown AGENT_RELAY_STORAGE_TYPE: {other}"
                    )))
                }
            };
        }
        if let Ok(path) = std::env::var("AGENT_RELAY_STORAGE_PATH") {
            config.storage.path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("AGENT_RELAY_STORAGE_URL") {
            config.storage.url = Some(url);
        }

        if let Ok(url) = std::env::var("AGENT_RELAY_CLOUD_URL") {
            let api_key = std::env::var("AGENT_RELAY_API_KEY").unwrap_or_default();
            if api_key.is_empty() {
                return Err(NodeError::Config(
                    "AGENT_RELAY_CLOUD_URL set without AGENT_RELAY_API_KEY".into(),
                ));
            }
            config.cloud = Some(CloudConfig { url, api_key });
        }

        Ok(config)
    }

    /// The SQLite file path in effect.
    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("messages.db"))
    }

    /// The policy files directory.
    #[must_use]
    pub fn policies_dir(&self) -> PathBuf {
        self.config_dir.join("policies")
    }

    /// The agent key directory.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("agent-relay");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("agent-relay");
    }
    PathBuf::from(".agent-relay")
}
