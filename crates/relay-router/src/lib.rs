//! # Relay Router
//!
//! The routing hub of the Agent Relay daemon: the address book of live
//! connections, direct/broadcast/topic/channel fan-out, shadow observers,
//! ACK-based reliable delivery with retry and TTL, per-(topic, peer)
//! sequencing, processing state, and session replay.
//!
//! All router state lives behind a single mutex; every mutation happens in
//! one critical section, and suspension happens only at storage and
//! connection I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod events;
mod pending;
mod router;
mod shadow;

pub use connection::{create_connection, AgentInfo, ConnectionHandle, ConnectionId, OUTBOUND_BUFFER};
pub use error::{Result, RouterError};
pub use events::RouterEvent;
pub use pending::RetryConfig;
pub use router::{AgentSummary, ProcessingInfo, Registration, Router, RouterConfig};
pub use shadow::{ShadowBinding, ShadowDirection, ShadowTrigger};

/// How long an agent may sit in `processing` before the indicator times out.
pub const PROCESSING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
