//! # Relay Protocol
//!
//! Wire protocol definitions for the Agent Relay daemon.
//!
//! This crate defines the envelope types, typed payloads, and the framed
//! JSON codec used for communication between agents and the relay.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod envelope;
mod error;
mod payload;

pub use codec::{decode_frame, encode_frame, validate};
pub use envelope::{Envelope, EnvelopeKind, WireSignature};
pub use error::{ProtocolError, Result};
pub use payload::{
    AckPayload, ChannelPayload, DeliveryInfo, HelloAckPayload, HelloPayload, Importance,
    MessageKind, SendPayload,
};

/// Current protocol version, carried as `v` on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size in bytes (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The literal target meaning "every registered agent except the sender".
pub const BROADCAST_TARGET: &str = "*";

/// Payload data key marking a shadow copy.
pub const SHADOW_COPY_KEY: &str = "_shadowCopy";

/// Payload data key naming the agent the shadow observes.
pub const SHADOW_OF_KEY: &str = "_shadowOf";

/// Payload data key recording the copy direction (`incoming` / `outgoing`).
pub const SHADOW_DIRECTION_KEY: &str = "_shadowDirection";

/// Payload data key carrying a shadow trigger name.
pub const SHADOW_TRIGGER_KEY: &str = "_shadowTrigger";

/// Returns the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
