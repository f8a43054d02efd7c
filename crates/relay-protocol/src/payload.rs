//! Typed payload shapes for each envelope kind.
//!
//! `data` fields stay schemaless (`serde_json` maps); only well-known keys
//! are interpreted, and only close to their consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The semantic kind of a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Ordinary conversational message.
    #[default]
    Message,
    /// A request for the recipient to act.
    Action,
    /// Daemon-originated system message.
    System,
}

/// Message importance, from routine to urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    /// Low priority.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Elevated priority.
    High,
    /// Requires immediate attention.
    Urgent,
}

/// Payload of a SEND envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPayload {
    /// Message kind.
    #[serde(default)]
    pub kind: MessageKind,
    /// Message body text.
    pub body: String,
    /// Schemaless attachment map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Thread id: a fresh id or the id of a parent message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Message importance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<Importance>,
    /// Id of the message this replies to.
    #[serde(rename = "replyTo", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl SendPayload {
    /// Creates a plain message payload.
    #[must_use]
    pub fn message(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Message,
            body: body.into(),
            data: None,
            thread: None,
            importance: None,
            reply_to: None,
        }
    }

    /// Creates a system payload (daemon-originated).
    #[must_use]
    pub fn system(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            ..Self::message(body)
        }
    }

    /// Returns true when the payload is marked urgent.
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        self.importance == Some(Importance::Urgent)
    }

    /// Reads a marker key from the data map.
    #[must_use]
    pub fn data_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// Inserts a marker key into the data map, creating it if absent.
    pub fn set_data_value(&mut self, key: &str, value: serde_json::Value) {
        self.data
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value);
    }
}

/// Per-recipient delivery metadata attached to DELIVER envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Recipient-scoped sequence number, strictly increasing per
    /// (topic, peer) stream within a session.
    pub seq: u64,
    /// The recipient's current session id.
    pub session_id: String,
}

/// Payload of a HELLO envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Agent name, unique within the daemon.
    pub agent_name: String,
    /// Optional CLI tag (e.g. which coding CLI runs the agent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    /// Optional program tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Optional model tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Optional free-form task description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Optional working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Previous session id, for replay on reconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Resume token resolving to a previous session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

impl HelloPayload {
    /// Creates a minimal HELLO payload for an agent name.
    #[must_use]
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            cli: None,
            program: None,
            model: None,
            task: None,
            working_directory: None,
            session_id: None,
            resume_token: None,
        }
    }
}

/// Payload of a HELLO_ACK envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAckPayload {
    /// The session id assigned to this connection.
    pub session_id: String,
    /// Number of stored messages about to be replayed, when resuming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_replay: Option<u64>,
}

/// Payload of an ACK envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Id of the DELIVER being acknowledged.
    pub ack_id: Uuid,
}

/// Payload of channel envelopes (JOIN / LEAVE / MESSAGE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPayload {
    /// Channel name. Direct-message channels use `dm:a:b[:c...]`.
    pub channel: String,
    /// Message body (CHANNEL_MESSAGE only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Thread id, honored like SEND threading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    /// Schemaless attachment map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ChannelPayload {
    /// Creates a membership payload (JOIN / LEAVE).
    #[must_use]
    pub fn membership(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            body: None,
            thread: None,
            data: None,
        }
    }

    /// Creates a channel message payload.
    #[must_use]
    pub fn message(channel: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            body: Some(body.into()),
            thread: None,
            data: None,
        }
    }
}
