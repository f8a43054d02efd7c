//! Router observability events.

use serde::Serialize;
use uuid::Uuid;

/// Events broadcast by the router for the daemon, dashboard, and metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouterEvent {
    /// An agent completed its handshake.
    AgentRegistered {
        /// Agent name.
        agent: String,
        /// Its session id.
        session_id: String,
        /// True when the session was resumed rather than fresh.
        resumed: bool,
    },
    /// An agent's connection went away.
    AgentUnregistered {
        /// Agent name.
        agent: String,
        /// Why the session closed.
        reason: String,
    },
    /// A DELIVER was handed to a connection.
    Delivered {
        /// Envelope id.
        id: Uuid,
        /// Sender.
        from: String,
        /// Recipient.
        to: String,
        /// Recipient-scoped sequence number.
        seq: u64,
    },
    /// A DELIVER was acknowledged.
    Acked {
        /// Envelope id.
        id: Uuid,
        /// The acknowledging agent.
        agent: String,
    },
    /// Retries or TTL ran out; the message stays stored for replay.
    DeliveryExhausted {
        /// Envelope id.
        id: Uuid,
        /// Intended recipient.
        to: String,
        /// Attempts made.
        attempts: u32,
    },
    /// An agent sat in `processing` past the timeout.
    ProcessingTimeout {
        /// Agent name.
        agent: String,
        /// The message that started the processing window.
        message_id: Uuid,
    },
    /// A shadow was bound to a primary.
    ShadowBound {
        /// The observed agent.
        primary: String,
        /// The observer.
        shadow: String,
    },
    /// A member joined a channel.
    ChannelJoined {
        /// Channel name.
        channel: String,
        /// The member.
        member: String,
    },
    /// A member left a channel.
    ChannelLeft {
        /// Channel name.
        channel: String,
        /// The member.
        member: String,
    },
}
