//! Multi-workspace orchestration.
//!
//! The orchestrator owns a disk-backed roster of workspaces
//! (`workspaces.json`), one optional running [`Daemon`] per workspace, and
//! an [`AgentSpawner`] port. Child-process spawning itself lives outside
//! the core; the default spawner only logs.

use crate::config::DaemonConfig;
use crate::daemon::Daemon;
use crate::error::{NodeError, Result};
use crate::metrics::RelayMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use relay_router::AgentSummary;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

const ROSTER_FILE: &str = "workspaces.json";
const EVENT_CAPACITY: usize = 256;

/// Port for starting and stopping agent processes in a workspace.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Starts an agent process in the workspace.
    async fn spawn(
        &self,
        workspace: &Path,
        name: &str,
        cli: Option<&str>,
        task: Option<&str>,
    ) -> Result<()>;

    /// Stops an agent process.
    async fn stop(&self, workspace: &Path, name: &str) -> Result<()>;
}

/// A spawner that records the request and does nothing; the real process
/// manager plugs in from outside the core.
#[derive(Debug, Default)]
pub struct NullSpawner;

#[async_trait]
impl AgentSpawner for NullSpawner {
    async fn spawn(
        &self,
        workspace: &Path,
        name: &str,
        cli: Option<&str>,
        _task: Option<&str>,
    ) -> Result<()> {
        info!(workspace = %workspace.display(), agent = name, cli, "spawn requested (no spawner installed)");
        Ok(())
    }

    async fn stop(&self, workspace: &Path, name: &str) -> Result<()> {
        info!(workspace = %workspace.display(), agent = name, "stop requested (no spawner installed)");
        Ok(())
    }
}

/// A workspace in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    /// Workspace id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Workspace directory.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterFile {
    workspaces: Vec<WorkspaceRecord>,
    active_workspace_id: Option<String>,
}

/// Events pushed to dashboard clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A workspace was added.
    WorkspaceAdded {
        /// The new record.
        workspace: WorkspaceRecord,
    },
    /// A workspace was removed.
    WorkspaceRemoved {
        /// Its id.
        id: String,
    },
    /// The active workspace changed.
    WorkspaceSwitched {
        /// The newly active id.
        id: String,
    },
    /// An agent spawn was requested.
    AgentSpawned {
        /// Workspace id.
        workspace_id: String,
        /// Agent name.
        agent: String,
    },
    /// An agent stop was requested.
    AgentStopped {
        /// Workspace id.
        workspace_id: String,
        /// Agent name.
        agent: String,
    },
    /// An agent process died; carries a hint for resuming its session.
    AgentCrashed {
        /// Workspace id.
        workspace_id: String,
        /// Agent name.
        agent: String,
        /// Resume hint (e.g. a resume token).
        resume_hint: Option<String>,
    },
}

/// Owns the workspace roster and the per-workspace daemons.
pub struct Orchestrator {
    config: DaemonConfig,
    metrics: Arc<RelayMetrics>,
    spawner: Arc<dyn AgentSpawner>,
    auto_start_daemons: bool,
    roster_path: PathBuf,
    workspaces: Mutex<Vec<WorkspaceRecord>>,
    active: Mutex<Option<String>>,
    daemons: Mutex<HashMap<String, Arc<Daemon>>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    /// Loads the roster from `<data_dir>/workspaces.json` (an absent file is
    /// an empty roster).
    ///
    /// # Errors
    ///
    /// Fails when a present roster file cannot be read or parsed.
    pub fn load(
        config: DaemonConfig,
        metrics: Arc<RelayMetrics>,
        spawner: Arc<dyn AgentSpawner>,
        auto_start_daemons: bool,
    ) -> Result<Self> {
        let roster_path = config.data_dir.join(ROSTER_FILE);
        let roster: RosterFile = if roster_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&roster_path)?)?
        } else {
            RosterFile::default()
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config,
            metrics,
            spawner,
            auto_start_daemons,
            roster_path,
            workspaces: Mutex::new(roster.workspaces),
            active: Mutex::new(roster.active_workspace_id),
            daemons: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Subscribes to orchestrator events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// The roster.
    #[must_use]
    pub fn workspaces(&self) -> Vec<WorkspaceRecord> {
        self.workspaces.lock().clone()
    }

    /// The active workspace id.
    #[must_use]
    pub fn active_workspace_id(&self) -> Option<String> {
        self.active.lock().clone()
    }

    /// Looks up one workspace.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<WorkspaceRecord> {
        self.workspaces.lock().iter().find(|w| w.id == id).cloned()
    }

    /// The running daemon for a workspace, if any.
    #[must_use]
    pub fn daemon(&self, id: &str) -> Option<Arc<Daemon>> {
        self.daemons.lock().get(id).cloned()
    }

    /// The active workspace's daemon, if one is running.
    #[must_use]
    pub fn active_daemon(&self) -> Option<Arc<Daemon>> {
        let active = self.active.lock().clone()?;
        self.daemon(&active)
    }

    fn persist(&self) -> Result<()> {
        let roster = RosterFile {
            workspaces: self.workspaces.lock().clone(),
            active_workspace_id: self.active.lock().clone(),
        };
        std::fs::create_dir_all(&self.config.data_dir)?;
        std::fs::write(&self.roster_path, serde_json::to_string_pretty(&roster)?)?;
        Ok(())
    }

    /// Adds a workspace and persists the roster. The first workspace added
    /// becomes active.
    ///
    /// # Errors
    ///
    /// Fails when the roster cannot be persisted.
    pub fn add_workspace(&self, name: &str, path: &Path) -> Result<WorkspaceRecord> {
        let record = WorkspaceRecord {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            name: name.to_string(),
            path: path.to_path_buf(),
        };
        {
            let mut workspaces = self.workspaces.lock();
            workspaces.push(record.clone());
            let mut active = self.active.lock();
            if active.is_none() {
                *active = Some(record.id.clone());
            }
        }
        self.persist()?;
        info!(id = %record.id, name, path = %path.display(), "workspace added");
        let _ = self.events.send(OrchestratorEvent::WorkspaceAdded {
            workspace: record.clone(),
        });
        Ok(record)
    }

    /// Removes a workspace, stopping its daemon.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids or when the roster cannot be persisted.
    pub async fn remove_workspace(&self, id: &str) -> Result<()> {
        let daemon = {
            let mut workspaces = self.workspaces.lock();
            let index = workspaces
                .iter()
                .position(|w| w.id == id)
                .ok_or_else(|| NodeError::UnknownWorkspace(id.to_string()))?;
            workspaces.remove(index);
            let mut active = self.active.lock();
            if active.as_deref() == Some(id) {
                *active = workspaces.first().map(|w| w.id.clone());
            }
            self.daemons.lock().remove(id)
        };
        if let Some(daemon) = daemon {
            daemon.shutdown().await;
        }
        self.persist()?;
        info!(id, "workspace removed");
        let _ = self
            .events
            .send(OrchestratorEvent::WorkspaceRemoved { id: id.to_string() });
        Ok(())
    }

    /// Marks a workspace active.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids or when the roster cannot be persisted.
    pub fn switch_workspace(&self, id: &str) -> Result<WorkspaceRecord> {
        let record = self
            .get(id)
            .ok_or_else(|| NodeError::UnknownWorkspace(id.to_string()))?;
        *self.active.lock() = Some(record.id.clone());
        self.persist()?;
        info!(id, "workspace switched");
        let _ = self
            .events
            .send(OrchestratorEvent::WorkspaceSwitched { id: id.to_string() });
        Ok(record)
    }

    /// Starts a daemon for one workspace if not already running.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids or daemon start failures.
    pub async fn start_daemon(&self, id: &str) -> Result<Arc<Daemon>> {
        if let Some(daemon) = self.daemon(id) {
            return Ok(daemon);
        }
        let record = self
            .get(id)
            .ok_or_else(|| NodeError::UnknownWorkspace(id.to_string()))?;
        let daemon = Daemon::start(&self.config, &record.path, &self.metrics).await?;
        self.daemons.lock().insert(id.to_string(), daemon.clone());
        Ok(daemon)
    }

    /// Boot pass: start daemons for every workspace whose directory exists,
    /// when auto-start is enabled.
    pub async fn start_daemons(&self) {
        if !self.auto_start_daemons {
            return;
        }
        let records = self.workspaces();
        for record in records {
            if !record.path.is_dir() {
                warn!(id = %record.id, path = %record.path.display(), "workspace directory missing; daemon not started");
                continue;
            }
            if let Err(e) = self.start_daemon(&record.id).await {
                warn!(id = %record.id, error = %e, "daemon auto-start failed");
            }
        }
    }

    /// Stops everything: all daemons, newest first.
    pub async fn shutdown(&self) {
        let daemons: Vec<Arc<Daemon>> = self.daemons.lock().drain().map(|(_, d)| d).collect();
        for daemon in daemons {
            daemon.shutdown().await;
        }
    }

    /// The registered agents of one workspace's daemon.
    ///
    /// # Errors
    ///
    /// Fails for unknown workspaces.
    pub fn agents(&self, id: &str) -> Result<Vec<AgentSummary>> {
        self.get(id)
            .ok_or_else(|| NodeError::UnknownWorkspace(id.to_string()))?;
        Ok(self
            .daemon(id)
            .map(|daemon| daemon.roster())
            .unwrap_or_default())
    }

    /// Proxies a spawn request to the workspace's spawner.
    ///
    /// # Errors
    ///
    /// Fails for unknown workspaces or spawner errors.
    pub async fn spawn_agent(
        &self,
        id: &str,
        name: &str,
        cli: Option<&str>,
        task: Option<&str>,
    ) -> Result<()> {
        let record = self
            .get(id)
            .ok_or_else(|| NodeError::UnknownWorkspace(id.to_string()))?;
        self.spawner.spawn(&record.path, name, cli, task).await?;
        let _ = self.events.send(OrchestratorEvent::AgentSpawned {
            workspace_id: id.to_string(),
            agent: name.to_string(),
        });
        Ok(())
    }

    /// Proxies a stop request to the workspace's spawner.
    ///
    /// # Errors
    ///
    /// Fails for unknown workspaces or spawner errors.
    pub async fn stop_agent(&self, id: &str, name: &str) -> Result<()> {
        let record = self
            .get(id)
            .ok_or_else(|| NodeError::UnknownWorkspace(id.to_string()))?;
        self.spawner.stop(&record.path, name).await?;
        let _ = self.events.send(OrchestratorEvent::AgentStopped {
            workspace_id: id.to_string(),
            agent: name.to_string(),
        });
        Ok(())
    }

    /// Propagates a child-death notice from the process manager, with a
    /// resume hint for restarting the agent.
    pub fn notify_agent_crashed(&self, id: &str, agent: &str, resume_hint: Option<String>) {
        warn!(workspace = id, agent, "agent crashed");
        let _ = self.events.send(OrchestratorEvent::AgentCrashed {
            workspace_id: id.to_string(),
            agent: agent.to_string(),
            resume_hint,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, StorageType};

    fn orchestrator(dir: &Path) -> Orchestrator {
        let config = DaemonConfig {
            data_dir: dir.join("data"),
            config_dir: dir.join("config"),
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                path: None,
                url: None,
            },
            cloud: None,
        };
        Orchestrator::load(config, RelayMetrics::new(), Arc::new(NullSpawner), false).unwrap()
    }

    #[tokio::test]
    async fn roster_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = orchestrator(dir.path());
        let record = first.add_workspace("main", &dir.path().join("ws")).unwrap();
        assert_eq!(first.active_workspace_id(), Some(record.id.clone()));

        // A fresh orchestrator over the same data dir sees the roster.
        let second = orchestrator(dir.path());
        assert_eq!(second.workspaces(), vec![record.clone()]);
        assert_eq!(second.active_workspace_id(), Some(record.id));
    }

    #[tokio::test]
    async fn switch_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let a = orch.add_workspace("a", &dir.path().join("a")).unwrap();
        let b = orch.add_workspace("b", &dir.path().join("b")).unwrap();

        assert_eq!(orch.active_workspace_id(), Some(a.id.clone()));
        orch.switch_workspace(&b.id).unwrap();
        assert_eq!(orch.active_workspace_id(), Some(b.id.clone()));

        orch.remove_workspace(&b.id).await.unwrap();
        // Active falls back to the first remaining workspace.
        assert_eq!(orch.active_workspace_id(), Some(a.id));

        assert!(matches!(
            orch.remove_workspace("nope").await,
            Err(NodeError::UnknownWorkspace(_))
        ));
    }

    #[tokio::test]
    async fn daemon_lifecycle_through_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let ws_dir = dir.path().join("ws");
        std::fs::create_dir_all(&ws_dir).unwrap();
        let record = orch.add_workspace("main", &ws_dir).unwrap();

        let daemon = orch.start_daemon(&record.id).await.unwrap();
        assert!(daemon.socket_path().exists());
        // Starting again returns the same daemon.
        let again = orch.start_daemon(&record.id).await.unwrap();
        assert!(Arc::ptr_eq(&daemon, &again));

        assert!(orch.agents(&record.id).unwrap().is_empty());
        assert!(orch.agents("nope").is_err());

        orch.shutdown().await;
        assert!(!daemon.socket_path().exists());
    }

    #[tokio::test]
    async fn spawn_and_stop_emit_events() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let record = orch.add_workspace("main", dir.path()).unwrap();
        let mut events = orch.subscribe_events();

        orch.spawn_agent(&record.id, "worker-1", Some("claude"), None)
            .await
            .unwrap();
        orch.stop_agent(&record.id, "worker-1").await.unwrap();
        orch.notify_agent_crashed(&record.id, "worker-1", Some("resume-tok".into()));

        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::AgentSpawned { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            OrchestratorEvent::AgentStopped { .. }
        ));
        match events.recv().await.unwrap() {
            OrchestratorEvent::AgentCrashed { resume_hint, .. } => {
                assert_eq!(resume_hint.as_deref(), Some("resume-tok"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
