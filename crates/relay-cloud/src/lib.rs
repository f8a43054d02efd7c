//! # Relay Cloud
//!
//! Best-effort bridge between a local relay daemon and the cloud: a
//! heartbeat loop that publishes the local roster, pulls queued
//! cross-machine messages and commands, and fetches credential refreshes on
//! demand. The bridge keeps no queue of its own; delivery to cross-machine
//! peers is best-effort.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod machine;
mod sync;
mod types;

pub use error::{CloudError, Result};
pub use machine::load_or_create_machine_id;
pub use sync::{CloudSync, CloudSyncConfig};
pub use types::{
    CloudCommand, CloudEvent, CrossMachineMessage, HeartbeatRequest, HeartbeatResponse,
    LocalAgent, LocalRoster, RemoteAgent,
};

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
