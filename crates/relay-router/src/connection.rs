//! Live connection handles.

use parking_lot::Mutex;
use relay_protocol::{Envelope, HelloPayload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Capacity of a connection's outbound buffer. A full buffer makes
/// [`ConnectionHandle::send`] return false so the router can skip the slow
/// peer and rely on retries.
pub const OUTBOUND_BUFFER: usize = 256;

/// Identity tags an agent presented at handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInfo {
    /// Agent name, unique within the daemon.
    pub name: String,
    /// CLI tag.
    pub cli: Option<String>,
    /// Program tag.
    pub program: Option<String>,
    /// Model tag.
    pub model: Option<String>,
    /// Free-form task description.
    pub task: Option<String>,
    /// Working directory.
    pub working_directory: Option<String>,
}

impl AgentInfo {
    /// Builds the info from a HELLO payload.
    #[must_use]
    pub fn from_hello(hello: &HelloPayload) -> Self {
        Self {
            name: hello.agent_name.clone(),
            cli: hello.cli.clone(),
            program: hello.program.clone(),
            model: hello.model.clone(),
            task: hello.task.clone(),
            working_directory: hello.working_directory.clone(),
        }
    }
}

/// A registered peer connection.
///
/// The handle owns the outbound buffer and the per-(topic, peer) sequence
/// counters. Counters are connection-scoped: a new session starts every
/// stream back at 1.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Connection id.
    pub id: ConnectionId,
    /// The agent behind the connection.
    pub agent: AgentInfo,
    /// The session opened for this connection.
    pub session_id: String,
    sender: mpsc::Sender<Envelope>,
    seqs: Mutex<HashMap<(String, String), u64>>,
    shutdown: Notify,
    is_shutdown: AtomicBool,
}

impl ConnectionHandle {
    /// Enqueues an envelope for the peer. Returns false when the outbound
    /// buffer is full or the peer is gone; the caller must not block on it.
    #[must_use]
    pub fn send(&self, envelope: Envelope) -> bool {
        self.sender.try_send(envelope).is_ok()
    }

    /// Returns the next sequence number for the (topic, peer) stream,
    /// starting at 1 and strictly increasing for the connection's lifetime.
    #[must_use]
    pub fn next_seq(&self, topic: Option<&str>, peer: &str) -> u64 {
        let key = (topic.unwrap_or_default().to_string(), peer.to_string());
        let mut seqs = self.seqs.lock();
        let seq = seqs.entry(key).or_insert(0);
        *seq += 1;
        *seq
    }

    /// True once the peer side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Signals the transport task to shut down; used when a newer
    /// registration evicts this connection.
    pub fn close(&self) {
        self.is_shutdown.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    /// True once [`Self::close`] has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Resolves when the connection has been closed. Intended for the
    /// transport task's select loop.
    pub async fn closed(&self) {
        while !self.is_shutdown() {
            self.shutdown.notified().await;
        }
    }
}

/// Creates a connection handle and the receiver its transport task drains.
#[must_use]
pub fn create_connection(
    agent: AgentInfo,
    session_id: String,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<Envelope>) {
    let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER);
    let connection = Arc::new(ConnectionHandle {
        id: uuid::Uuid::new_v4().to_string(),
        agent,
        session_id,
        sender,
        seqs: Mutex::new(HashMap::new()),
        shutdown: Notify::new(),
        is_shutdown: AtomicBool::new(false),
    });
    (connection, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Envelope;

    fn info(name: &str) -> AgentInfo {
        AgentInfo {
            name: name.to_string(),
            ..AgentInfo::default()
        }
    }

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (conn, mut rx) = create_connection(info("alice"), "s1".into());
        assert!(conn.send(Envelope::ping()));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_false_on_full_buffer() {
        let (conn, _rx) = create_connection(info("alice"), "s1".into());
        for _ in 0..OUTBOUND_BUFFER {
            assert!(conn.send(Envelope::ping()));
        }
        assert!(!conn.send(Envelope::ping()));
    }

    #[tokio::test]
    async fn send_false_after_receiver_dropped() {
        let (conn, rx) = create_connection(info("alice"), "s1".into());
        drop(rx);
        assert!(!conn.send(Envelope::ping()));
        assert!(conn.is_closed());
    }

    #[test]
    fn seq_streams_are_independent_and_increasing() {
        let (conn, _rx) = create_connection(info("bob"), "s1".into());

        assert_eq!(conn.next_seq(None, "alice"), 1);
        assert_eq!(conn.next_seq(None, "alice"), 2);
        assert_eq!(conn.next_seq(None, "carol"), 1);
        assert_eq!(conn.next_seq(Some("builds"), "alice"), 1);
        assert_eq!(conn.next_seq(None, "alice"), 3);
    }
}
