//! Stored row types and query shapes.

use relay_protocol::{DeliveryInfo, Envelope, MessageKind, SendPayload, BROADCAST_TARGET};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of a stored message.
///
/// Status only advances: `unread -> read -> acked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Persisted but not yet acknowledged.
    Unread,
    /// Seen by the recipient.
    Read,
    /// Acknowledged by the recipient.
    Acked,
}

impl MessageStatus {
    /// Monotonic rank used to reject regressions.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Unread => 0,
            MessageStatus::Read => 1,
            MessageStatus::Acked => 2,
        }
    }

    /// Parse from the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unread" => Some(MessageStatus::Unread),
            "read" => Some(MessageStatus::Read),
            "acked" => Some(MessageStatus::Acked),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Unread => write!(f, "unread"),
            MessageStatus::Read => write!(f, "read"),
            MessageStatus::Acked => write!(f, "acked"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCloseReason {
    /// Closed by an explicit request.
    Explicit,
    /// Closed because the connection dropped.
    Disconnect,
    /// Closed after a transport or protocol error.
    Error,
}

impl std::fmt::Display for SessionCloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionCloseReason::Explicit => write!(f, "explicit"),
            SessionCloseReason::Disconnect => write!(f, "disconnect"),
            SessionCloseReason::Error => write!(f, "error"),
        }
    }
}

impl SessionCloseReason {
    /// Parse from the persisted string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(SessionCloseReason::Explicit),
            "disconnect" => Some(SessionCloseReason::Disconnect),
            "error" => Some(SessionCloseReason::Error),
            _ => None,
        }
    }
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Envelope id; unique in the store.
    pub id: Uuid,
    /// Millisecond timestamp.
    pub ts: u64,
    /// Sending agent.
    pub from: String,
    /// Recipient agent (one row per recipient, even for broadcasts).
    pub to: String,
    /// Topic, when the message was topic-scoped.
    pub topic: Option<String>,
    /// Message kind.
    pub kind: MessageKind,
    /// Body text.
    pub body: String,
    /// Schemaless attachment map, persisted as JSON.
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Thread id.
    pub thread: Option<String>,
    /// Recipient-scoped delivery sequence number.
    pub delivery_seq: Option<u64>,
    /// The recipient session the sequence number belongs to.
    pub delivery_session_id: Option<String>,
    /// The sender's session, when known.
    pub session_id: Option<String>,
    /// Delivery status.
    pub status: MessageStatus,
    /// True for urgent-importance messages.
    pub is_urgent: bool,
    /// True when the original SEND targeted `*`.
    pub is_broadcast: bool,
}

impl StoredMessage {
    /// Builds the persisted row for one recipient of a routed SEND.
    #[must_use]
    pub fn from_send(
        envelope: &Envelope,
        payload: &SendPayload,
        recipient: &str,
        delivery: &DeliveryInfo,
    ) -> Self {
        Self {
            id: envelope.id,
            ts: envelope.ts,
            from: envelope.from.clone().unwrap_or_default(),
            to: recipient.to_string(),
            topic: envelope.topic.clone(),
            kind: payload.kind,
            body: payload.body.clone(),
            data: payload.data.clone(),
            thread: payload.thread.clone(),
            delivery_seq: Some(delivery.seq),
            delivery_session_id: Some(delivery.session_id.clone()),
            session_id: None,
            status: MessageStatus::Unread,
            is_urgent: payload.is_urgent(),
            is_broadcast: envelope.to.as_deref() == Some(BROADCAST_TARGET),
        }
    }

    /// Approximate in-memory size, used for batch byte accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        let data_len = self
            .data
            .as_ref()
            .map(|d| serde_json::to_string(d).map(|s| s.len()).unwrap_or(0))
            .unwrap_or(0);
        // Fixed fields plus the variable-length strings.
        96 + self.from.len()
            + self.to.len()
            + self.body.len()
            + self.topic.as_deref().map_or(0, str::len)
            + self.thread.as_deref().map_or(0, str::len)
            + data_len
    }
}

/// A query result row: the message plus its reply count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// The stored message.
    #[serde(flatten)]
    pub message: StoredMessage,
    /// Number of stored rows whose `thread` equals this message's id.
    pub reply_count: u64,
}

/// Sort order for message queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

/// Filter set for [`crate::MessageStore::get_messages`].
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Filter by sender.
    pub from: Option<String>,
    /// Filter by recipient.
    pub to: Option<String>,
    /// Filter by topic.
    pub topic: Option<String>,
    /// Filter by thread id.
    pub thread: Option<String>,
    /// Only rows with `ts >= since_ts`.
    pub since_ts: Option<u64>,
    /// Only unread rows.
    pub unread_only: bool,
    /// Only urgent rows.
    pub urgent_only: bool,
    /// Sort order by timestamp.
    pub order: SortOrder,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

impl MessageQuery {
    /// Query for a recipient's messages.
    #[must_use]
    pub fn for_recipient(to: impl Into<String>) -> Self {
        Self {
            to: Some(to.into()),
            ..Self::default()
        }
    }

    /// Query for a thread's replies.
    #[must_use]
    pub fn for_thread(thread: impl Into<String>) -> Self {
        Self {
            thread: Some(thread.into()),
            ..Self::default()
        }
    }

    /// True when `message` passes every filter.
    #[must_use]
    pub fn matches(&self, message: &StoredMessage) -> bool {
        if let Some(from) = &self.from {
            if &message.from != from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if &message.to != to {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if message.topic.as_deref() != Some(topic.as_str()) {
                return false;
            }
        }
        if let Some(thread) = &self.thread {
            if message.thread.as_deref() != Some(thread.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since_ts {
            if message.ts < since {
                return false;
            }
        }
        if self.unread_only && message.status != MessageStatus::Unread {
            return false;
        }
        if self.urgent_only && !message.is_urgent {
            return false;
        }
        true
    }
}

/// A registered-connection lifetime for an agent name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub id: String,
    /// The agent that owned the session.
    pub agent_name: String,
    /// CLI tag from the handshake.
    pub cli: Option<String>,
    /// Project id, when the agent reported one.
    pub project_id: Option<String>,
    /// Millisecond timestamp the session opened.
    pub started_at: u64,
    /// Millisecond timestamp the session closed.
    pub ended_at: Option<u64>,
    /// Messages routed to the agent during the session.
    pub message_count: u64,
    /// Optional human summary.
    pub summary: Option<String>,
    /// Token that lets a reconnecting agent resume this session.
    pub resume_token: Option<String>,
    /// How the session ended.
    pub closed_by: Option<SessionCloseReason>,
}

impl Session {
    /// Opens a new session for an agent.
    #[must_use]
    pub fn open(id: impl Into<String>, agent_name: impl Into<String>, started_at: u64) -> Self {
        Self {
            id: id.into(),
            agent_name: agent_name.into(),
            cli: None,
            project_id: None,
            started_at,
            ended_at: None,
            message_count: 0,
            summary: None,
            resume_token: None,
            closed_by: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Importance;

    fn sample(from: &str, to: &str, body: &str) -> StoredMessage {
        let payload = SendPayload::message(body);
        let env = Envelope::send(from, to, None, &payload).unwrap();
        StoredMessage::from_send(
            &env,
            &payload,
            to,
            &DeliveryInfo {
                seq: 1,
                session_id: "s".into(),
            },
        )
    }

    #[test]
    fn status_is_ordered() {
        assert!(MessageStatus::Unread.rank() < MessageStatus::Read.rank());
        assert!(MessageStatus::Read.rank() < MessageStatus::Acked.rank());
    }

    #[test]
    fn from_send_marks_broadcast() {
        let payload = SendPayload::message("to all");
        let env = Envelope::send("alice", "*", None, &payload).unwrap();
        let row = StoredMessage::from_send(
            &env,
            &payload,
            "bob",
            &DeliveryInfo {
                seq: 3,
                session_id: "sess".into(),
            },
        );
        assert!(row.is_broadcast);
        assert_eq!(row.to, "bob");
        assert_eq!(row.delivery_seq, Some(3));
        assert_eq!(row.status, MessageStatus::Unread);
    }

    #[test]
    fn from_send_urgent_flag() {
        let mut payload = SendPayload::message("now!");
        payload.importance = Some(Importance::Urgent);
        let env = Envelope::send("alice", "bob", None, &payload).unwrap();
        let row = StoredMessage::from_send(
            &env,
            &payload,
            "bob",
            &DeliveryInfo {
                seq: 1,
                session_id: "s".into(),
            },
        );
        assert!(row.is_urgent);
    }

    #[test]
    fn query_filters() {
        let msg = sample("alice", "bob", "hi");

        assert!(MessageQuery::for_recipient("bob").matches(&msg));
        assert!(!MessageQuery::for_recipient("carol").matches(&msg));

        let mut q = MessageQuery::default();
        q.from = Some("alice".into());
        q.unread_only = true;
        assert!(q.matches(&msg));

        q.urgent_only = true;
        assert!(!q.matches(&msg));
    }

    #[test]
    fn query_since_ts() {
        let msg = sample("a", "b", "x");
        let mut q = MessageQuery::default();
        q.since_ts = Some(msg.ts + 1);
        assert!(!q.matches(&msg));
        q.since_ts = Some(msg.ts);
        assert!(q.matches(&msg));
    }
}
