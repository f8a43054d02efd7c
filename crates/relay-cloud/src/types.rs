//! Wire shapes and events for the cloud bridge.

use serde::{Deserialize, Serialize};

/// One local agent as reported in the heartbeat roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAgent {
    /// Agent name.
    pub name: String,
    /// CLI tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
}

/// Port the daemon implements so the bridge can read the local roster.
pub trait LocalRoster: Send + Sync {
    /// The currently registered local agents.
    fn agents(&self) -> Vec<LocalAgent>;
}

/// Heartbeat request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    /// This machine's persistent id.
    pub machine_id: String,
    /// Local agent roster.
    pub agents: Vec<LocalAgent>,
    /// Seconds since the bridge started.
    pub uptime_secs: u64,
    /// Process resident set size in bytes, best effort.
    pub memory_bytes: u64,
}

/// An agent known to the cloud, possibly on another machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAgent {
    /// Agent name.
    pub name: String,
    /// The machine the agent runs on.
    #[serde(default)]
    pub machine_id: String,
    /// CLI tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
}

/// A command surfaced by the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCommand {
    /// Command id.
    pub id: String,
    /// Command name.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A message relayed across machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossMachineMessage {
    /// Sending agent.
    pub from: String,
    /// Target local agent.
    pub to: String,
    /// Message body.
    pub body: String,
    /// The sender's machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Thread id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

/// Heartbeat response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// Commands for this machine.
    #[serde(default)]
    pub commands: Vec<CloudCommand>,
    /// Queued cross-machine messages for local agents.
    #[serde(default)]
    pub messages: Vec<CrossMachineMessage>,
    /// Every agent the cloud knows about.
    #[serde(default)]
    pub all_agents: Vec<RemoteAgent>,
}

/// Events emitted by the sync loop.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    /// The bridge reached the cloud.
    Connected,
    /// The cloud rejected our credentials; the loop has stopped.
    Disconnected,
    /// A heartbeat failed; the loop keeps running.
    Error(String),
    /// The cloud issued a command.
    Command(CloudCommand),
    /// A queued message for a local agent arrived.
    CrossMachineMessage(CrossMachineMessage),
    /// The set of agents on other machines changed.
    RemoteAgentsUpdated(Vec<RemoteAgent>),
    /// Refreshed credentials arrived.
    CredentialsUpdated(serde_json::Value),
}
