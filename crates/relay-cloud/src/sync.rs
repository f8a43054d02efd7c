//! The heartbeat sync loop.

use crate::error::{CloudError, Result};
use crate::types::{
    CloudEvent, CrossMachineMessage, HeartbeatRequest, HeartbeatResponse, LocalRoster, RemoteAgent,
};
use crate::DEFAULT_HEARTBEAT_INTERVAL;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cloud bridge configuration.
#[derive(Debug, Clone)]
pub struct CloudSyncConfig {
    /// Cloud base URL.
    pub base_url: String,
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
}

impl CloudSyncConfig {
    /// Builds a config with the default heartbeat interval.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// The event-emitting sync loop.
pub struct CloudSync {
    config: CloudSyncConfig,
    machine_id: String,
    client: reqwest::Client,
    roster: Arc<dyn LocalRoster>,
    connected: AtomicBool,
    running: AtomicBool,
    started_at: Instant,
    events: mpsc::UnboundedSender<CloudEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CloudSync {
    /// Creates the bridge and its event receiver. Call
    /// [`CloudSync::start`] to begin heartbeating.
    #[must_use]
    pub fn new(
        config: CloudSyncConfig,
        machine_id: String,
        roster: Arc<dyn LocalRoster>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CloudEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                machine_id,
                client: reqwest::Client::new(),
                roster,
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                started_at: Instant::now(),
                events,
                task: Mutex::new(None),
            }),
            rx,
        )
    }

    /// This machine's persistent id.
    #[must_use]
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// True once a heartbeat has succeeded and the loop is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Starts the heartbeat loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            loop {
                let Some(sync) = weak.upgrade() else {
                    return;
                };
                if !sync.running.load(Ordering::Acquire) {
                    return;
                }
                if !sync.heartbeat_once().await {
                    sync.running.store(false, Ordering::Release);
                    return;
                }
                drop(sync);
                tokio::time::sleep(interval).await;
            }
        });
        *self.task.lock() = Some(task);
        info!(machine_id = %self.machine_id, "cloud sync started");
    }

    /// Stops the loop. In-flight operations observe "not connected".
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("cloud sync stopped");
    }

    /// One heartbeat cycle. Returns false when the loop must stop (401).
    async fn heartbeat_once(&self) -> bool {
        let request = HeartbeatRequest {
            machine_id: self.machine_id.clone(),
            agents: self.roster.agents(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            memory_bytes: read_memory_bytes(),
        };

        let url = format!("{}/api/machines/heartbeat", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "heartbeat transport failure");
                let _ = self.events.send(CloudEvent::Error(e.to_string()));
                return true;
            }
        };

        let status = response.status();
        if status.as_u16() == 401 {
            warn!("cloud rejected credentials; stopping sync loop");
            self.connected.store(false, Ordering::Release);
            let _ = self.events.send(CloudEvent::Disconnected);
            return false;
        }
        if !status.is_success() {
            let _ = self
                .events
                .send(CloudEvent::Error(format!("heartbeat returned {status}")));
            return true;
        }

        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("cloud sync connected");
            let _ = self.events.send(CloudEvent::Connected);
        }

        let body: HeartbeatResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                let _ = self.events.send(CloudEvent::Error(e.to_string()));
                return true;
            }
        };

        for command in body.commands {
            let _ = self.events.send(CloudEvent::Command(command));
        }
        for message in body.messages {
            let _ = self.events.send(CloudEvent::CrossMachineMessage(message));
        }

        let local_names: HashSet<String> = self
            .roster
            .agents()
            .into_iter()
            .map(|a| a.name)
            .collect();
        let remote = filter_remote_agents(body.all_agents, &local_names, &self.machine_id);
        if !remote.is_empty() {
            let _ = self.events.send(CloudEvent::RemoteAgentsUpdated(remote));
        }
        true
    }

    /// Relays a message to an agent on another machine. Best effort; only
    /// accepted while connected.
    ///
    /// # Errors
    ///
    /// Fails with [`CloudError::NotConnected`] when the bridge is down, and
    /// with transport or API errors otherwise.
    pub async fn send_cross_machine_message(&self, message: &CrossMachineMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(CloudError::NotConnected);
        }

        let url = format!("{}/api/messages", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!(to = %message.to, "cross-machine message relayed");
        Ok(())
    }

    /// Pulls refreshed credentials on demand and emits them as an event.
    ///
    /// # Errors
    ///
    /// Fails when not connected or the request fails.
    pub async fn pull_credentials(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(CloudError::NotConnected);
        }

        let url = format!("{}/api/credentials", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let credentials: serde_json::Value = response.json().await?;
        let _ = self.events.send(CloudEvent::CredentialsUpdated(credentials));
        Ok(())
    }
}

/// Remote agents are everyone the cloud knows minus local names and agents
/// reported by this machine itself.
fn filter_remote_agents(
    all: Vec<RemoteAgent>,
    local_names: &HashSet<String>,
    machine_id: &str,
) -> Vec<RemoteAgent> {
    all.into_iter()
        .filter(|agent| agent.machine_id != machine_id && !local_names.contains(&agent.name))
        .collect()
}

/// Resident set size from `/proc/self/statm`, 0 where unavailable.
fn read_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LocalAgent;

    struct FixedRoster(Vec<LocalAgent>);

    impl LocalRoster for FixedRoster {
        fn agents(&self) -> Vec<LocalAgent> {
            self.0.clone()
        }
    }

    fn bridge() -> (Arc<CloudSync>, mpsc::UnboundedReceiver<CloudEvent>) {
        CloudSync::new(
            CloudSyncConfig::new("http://cloud.invalid", "key"),
            "host-0011223344556677".to_string(),
            Arc::new(FixedRoster(vec![LocalAgent {
                name: "alice".into(),
                cli: None,
            }])),
        )
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let (sync, _events) = bridge();
        let message = CrossMachineMessage {
            from: "alice".into(),
            to: "bob".into(),
            body: "hi".into(),
            machine_id: None,
            thread: None,
        };
        assert!(matches!(
            sync.send_cross_machine_message(&message).await,
            Err(CloudError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn pull_credentials_requires_connection() {
        let (sync, _events) = bridge();
        assert!(matches!(
            sync.pull_credentials().await,
            Err(CloudError::NotConnected)
        ));
    }

    #[test]
    fn remote_filter_drops_local_and_own_machine() {
        let local: HashSet<String> = ["alice".to_string()].into_iter().collect();
        let all = vec![
            RemoteAgent {
                name: "alice".into(),
                machine_id: "other".into(),
                cli: None,
            },
            RemoteAgent {
                name: "bob".into(),
                machine_id: "host-0011223344556677".into(),
                cli: None,
            },
            RemoteAgent {
                name: "carol".into(),
                machine_id: "other".into(),
                cli: None,
            },
        ];

        let remote = filter_remote_agents(all, &local, "host-0011223344556677");
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "carol");
    }

    #[test]
    fn stop_is_idempotent_and_disconnects() {
        let (sync, _events) = bridge();
        sync.stop();
        sync.stop();
        assert!(!sync.is_connected());
    }

    #[test]
    fn heartbeat_response_parses_defaults() {
        let body: HeartbeatResponse = serde_json::from_str("{}").unwrap();
        assert!(body.commands.is_empty());
        assert!(body.messages.is_empty());
        assert!(body.all_agents.is_empty());
    }
}
