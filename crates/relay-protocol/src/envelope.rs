//! Envelope definitions.

use crate::error::{ProtocolError, Result};
use crate::payload::{
    AckPayload, ChannelPayload, DeliveryInfo, HelloAckPayload, HelloPayload, SendPayload,
};
use crate::{now_ms, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    /// Handshake initiation from an agent.
    Hello,
    /// Handshake response from the daemon.
    HelloAck,
    /// A message submitted for routing.
    Send,
    /// A routed message handed to a recipient.
    Deliver,
    /// Recipient confirmation of a DELIVER.
    Ack,
    /// Subscribe to a topic.
    Subscribe,
    /// Unsubscribe from a topic.
    Unsubscribe,
    /// Join a channel.
    ChannelJoin,
    /// Leave a channel.
    ChannelLeave,
    /// A message fanned out to channel members.
    ChannelMessage,
    /// Keep-alive ping.
    Ping,
    /// Keep-alive pong.
    Pong,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvelopeKind::Hello => "HELLO",
            EnvelopeKind::HelloAck => "HELLO_ACK",
            EnvelopeKind::Send => "SEND",
            EnvelopeKind::Deliver => "DELIVER",
            EnvelopeKind::Ack => "ACK",
            EnvelopeKind::Subscribe => "SUBSCRIBE",
            EnvelopeKind::Unsubscribe => "UNSUBSCRIBE",
            EnvelopeKind::ChannelJoin => "CHANNEL_JOIN",
            EnvelopeKind::ChannelLeave => "CHANNEL_LEAVE",
            EnvelopeKind::ChannelMessage => "CHANNEL_MESSAGE",
            EnvelopeKind::Ping => "PING",
            EnvelopeKind::Pong => "PONG",
        };
        write!(f, "{s}")
    }
}

/// Compact signature side-channel attached to envelopes.
///
/// Fields are single letters on the wire to keep frames small:
/// `s` = signature, `k` = key id, `t` = signed-at timestamp, `a` = algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSignature {
    /// Hex-encoded signature bytes.
    pub s: String,
    /// Key id (the signer's public key).
    pub k: String,
    /// Millisecond timestamp the signature was produced at.
    pub t: u64,
    /// Algorithm name (`hmac-sha256` or `ed25519`).
    pub a: String,
}

/// A versioned, typed wire record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub v: u32,
    /// The envelope kind.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Globally unique envelope id.
    pub id: Uuid,
    /// Millisecond Unix timestamp.
    pub ts: u64,
    /// Sending agent name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target agent name or `*` for broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Topic for selective broadcast and subscriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Kind-dependent payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// Optional signature side-channel.
    #[serde(rename = "_sig", default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<WireSignature>,
}

impl Envelope {
    /// Creates a bare envelope of the given kind with a fresh id.
    #[must_use]
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            id: Uuid::new_v4(),
            ts: now_ms(),
            from: None,
            to: None,
            topic: None,
            payload: serde_json::Value::Null,
            sig: None,
        }
    }

    /// Creates a HELLO envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn hello(payload: &HelloPayload) -> Result<Self> {
        let mut env = Self::new(EnvelopeKind::Hello);
        env.from = Some(payload.agent_name.clone());
        env.payload = serde_json::to_value(payload)?;
        Ok(env)
    }

    /// Creates a HELLO_ACK envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn hello_ack(payload: &HelloAckPayload) -> Result<Self> {
        let mut env = Self::new(EnvelopeKind::HelloAck);
        env.payload = serde_json::to_value(payload)?;
        Ok(env)
    }

    /// Creates a SEND envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn send(from: &str, to: &str, topic: Option<&str>, payload: &SendPayload) -> Result<Self> {
        let mut env = Self::new(EnvelopeKind::Send);
        env.from = Some(from.to_string());
        env.to = Some(to.to_string());
        env.topic = topic.map(str::to_string);
        env.payload = serde_json::to_value(payload)?;
        Ok(env)
    }

    /// Builds the DELIVER for a routed SEND, preserving the original id,
    /// sender, and payload while attaching per-recipient delivery metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the combined payload cannot be built.
    pub fn deliver_from(send: &Envelope, recipient: &str, delivery: DeliveryInfo) -> Result<Self> {
        let mut payload = match &send.payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(ProtocolError::UnexpectedPayload {
                    kind: send.kind.to_string(),
                    reason: format!("expected object payload, got {other}"),
                })
            }
        };
        payload.insert("delivery".to_string(), serde_json::to_value(delivery)?);

        Ok(Self {
            v: PROTOCOL_VERSION,
            kind: EnvelopeKind::Deliver,
            id: send.id,
            ts: now_ms(),
            from: send.from.clone(),
            to: Some(recipient.to_string()),
            topic: send.topic.clone(),
            payload: serde_json::Value::Object(payload),
            sig: None,
        })
    }

    /// Creates an ACK envelope for a delivered id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn ack(from: &str, ack_id: Uuid) -> Result<Self> {
        let mut env = Self::new(EnvelopeKind::Ack);
        env.from = Some(from.to_string());
        env.payload = serde_json::to_value(AckPayload { ack_id })?;
        Ok(env)
    }

    /// Creates a SUBSCRIBE or UNSUBSCRIBE envelope for a topic.
    #[must_use]
    pub fn subscription(kind: EnvelopeKind, from: &str, topic: &str) -> Self {
        let mut env = Self::new(kind);
        env.from = Some(from.to_string());
        env.topic = Some(topic.to_string());
        env
    }

    /// Creates a channel envelope (JOIN / LEAVE / MESSAGE).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn channel(kind: EnvelopeKind, from: &str, payload: &ChannelPayload) -> Result<Self> {
        let mut env = Self::new(kind);
        env.from = Some(from.to_string());
        env.payload = serde_json::to_value(payload)?;
        Ok(env)
    }

    /// Creates a PING envelope.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(EnvelopeKind::Ping)
    }

    /// Creates the PONG reply for a ping.
    #[must_use]
    pub fn pong(ping: &Envelope) -> Self {
        let mut env = Self::new(EnvelopeKind::Pong);
        env.payload = serde_json::json!({ "ping_id": ping.id });
        env
    }

    /// Deserializes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedPayload`] if the payload does not
    /// match the expected shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProtocolError::UnexpectedPayload {
                kind: self.kind.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Extracts the HELLO payload; fails unless this is a HELLO.
    ///
    /// # Errors
    ///
    /// Returns an error for non-HELLO envelopes or malformed payloads.
    pub fn hello_payload(&self) -> Result<HelloPayload> {
        self.expect_kind(EnvelopeKind::Hello)?;
        self.payload_as()
    }

    /// Extracts the SEND payload; also accepted for DELIVER envelopes,
    /// which carry the same body shape plus delivery metadata.
    ///
    /// # Errors
    ///
    /// Returns an error for other kinds or malformed payloads.
    pub fn send_payload(&self) -> Result<SendPayload> {
        if self.kind != EnvelopeKind::Send && self.kind != EnvelopeKind::Deliver {
            return Err(ProtocolError::UnexpectedPayload {
                kind: self.kind.to_string(),
                reason: "not a SEND/DELIVER envelope".to_string(),
            });
        }
        self.payload_as()
    }

    /// Extracts the delivery metadata from a DELIVER envelope.
    ///
    /// # Errors
    ///
    /// Returns an error for non-DELIVER envelopes or missing metadata.
    pub fn delivery_info(&self) -> Result<DeliveryInfo> {
        self.expect_kind(EnvelopeKind::Deliver)?;
        let delivery = self.payload.get("delivery").cloned().ok_or_else(|| {
            ProtocolError::UnexpectedPayload {
                kind: self.kind.to_string(),
                reason: "missing delivery metadata".to_string(),
            }
        })?;
        serde_json::from_value(delivery).map_err(|e| ProtocolError::UnexpectedPayload {
            kind: self.kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Extracts the ACK payload; fails unless this is an ACK.
    ///
    /// # Errors
    ///
    /// Returns an error for non-ACK envelopes or malformed payloads.
    pub fn ack_payload(&self) -> Result<AckPayload> {
        self.expect_kind(EnvelopeKind::Ack)?;
        self.payload_as()
    }

    /// Extracts a channel payload; fails for non-channel envelopes.
    ///
    /// # Errors
    ///
    /// Returns an error for other kinds or malformed payloads.
    pub fn channel_payload(&self) -> Result<ChannelPayload> {
        match self.kind {
            EnvelopeKind::ChannelJoin
            | EnvelopeKind::ChannelLeave
            | EnvelopeKind::ChannelMessage => self.payload_as(),
            _ => Err(ProtocolError::UnexpectedPayload {
                kind: self.kind.to_string(),
                reason: "not a channel envelope".to_string(),
            }),
        }
    }

    fn expect_kind(&self, want: EnvelopeKind) -> Result<()> {
        if self.kind == want {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedPayload {
                kind: self.kind.to_string(),
                reason: format!("expected {want}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::MessageKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_wire_names() {
        let json = serde_json::to_string(&EnvelopeKind::ChannelMessage).unwrap();
        assert_eq!(json, "\"CHANNEL_MESSAGE\"");
        let parsed: EnvelopeKind = serde_json::from_str("\"HELLO_ACK\"").unwrap();
        assert_eq!(parsed, EnvelopeKind::HelloAck);
    }

    #[test]
    fn send_roundtrip() {
        let payload = SendPayload::message("hi there");
        let env = Envelope::send("alice", "bob", None, &payload).unwrap();

        assert_eq!(env.kind, EnvelopeKind::Send);
        assert_eq!(env.from.as_deref(), Some("alice"));
        assert_eq!(env.to.as_deref(), Some("bob"));

        let extracted = env.send_payload().unwrap();
        assert_eq!(extracted.body, "hi there");
        assert_eq!(extracted.kind, MessageKind::Message);
    }

    #[test]
    fn deliver_preserves_id_and_attaches_delivery() {
        let payload = SendPayload::message("hello");
        let send = Envelope::send("alice", "bob", Some("builds"), &payload).unwrap();
        let deliver = Envelope::deliver_from(
            &send,
            "bob",
            DeliveryInfo {
                seq: 7,
                session_id: "sess-1".to_string(),
            },
        )
        .unwrap();

        assert_eq!(deliver.id, send.id);
        assert_eq!(deliver.kind, EnvelopeKind::Deliver);
        assert_eq!(deliver.topic.as_deref(), Some("builds"));

        let info = deliver.delivery_info().unwrap();
        assert_eq!(info.seq, 7);
        assert_eq!(info.session_id, "sess-1");

        // The original body survives alongside the delivery metadata.
        assert_eq!(deliver.send_payload().unwrap().body, "hello");
    }

    #[test]
    fn ack_payload_roundtrip() {
        let id = Uuid::new_v4();
        let env = Envelope::ack("bob", id).unwrap();
        assert_eq!(env.ack_payload().unwrap().ack_id, id);
    }

    #[test]
    fn payload_kind_mismatch_rejected() {
        let env = Envelope::ping();
        assert!(matches!(
            env.ack_payload(),
            Err(ProtocolError::UnexpectedPayload { .. })
        ));
    }
}
