//! Reliable-delivery bookkeeping.

use crate::connection::ConnectionId;
use relay_protocol::Envelope;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Retry policy for unACKed DELIVERs.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// How long to wait for an ACK before resending.
    pub ack_timeout: Duration,
    /// Maximum delivery attempts before giving up.
    pub max_attempts: u32,
    /// Total time a delivery may stay pending.
    pub delivery_ttl: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            max_attempts: 5,
            delivery_ttl: Duration::from_secs(60),
        }
    }
}

/// An unACKed DELIVER with its retry timer.
///
/// An entry exists exactly while the DELIVER is in flight: it is removed on
/// ACK from the same connection, on attempt/TTL exhaustion, and when the
/// recipient connection goes away. Entry and timer are created and removed
/// together under the router lock.
#[derive(Debug)]
pub(crate) struct PendingDelivery {
    pub envelope: Envelope,
    pub connection_id: ConnectionId,
    pub attempts: u32,
    pub first_sent_at: Instant,
    pub timer: Option<JoinHandle<()>>,
}

impl PendingDelivery {
    pub(crate) fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for PendingDelivery {
    fn drop(&mut self) {
        self.abort_timer();
    }
}
