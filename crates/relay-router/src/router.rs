//! The router: address book, fan-out, reliable delivery, replay.

use crate::connection::{create_connection, AgentInfo, ConnectionHandle, ConnectionId};
use crate::error::Result;
use crate::events::RouterEvent;
use crate::pending::{PendingDelivery, RetryConfig};
use crate::shadow::{ShadowBinding, ShadowDirection, ShadowTrigger};
use crate::PROCESSING_TIMEOUT;
use parking_lot::Mutex;
use relay_policy::PolicyEngine;
use relay_protocol::{
    DeliveryInfo, Envelope, EnvelopeKind, HelloPayload, Importance, SendPayload, BROADCAST_TARGET,
    SHADOW_COPY_KEY, SHADOW_DIRECTION_KEY, SHADOW_OF_KEY, SHADOW_TRIGGER_KEY,
};
use relay_signing::SignatureGate;
use relay_storage::{
    MessageStatus, MessageStore, Session, SessionCloseReason, StorageError, StoredMessage,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the router event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Router tunables.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Reliable-delivery retry policy.
    pub retry: RetryConfig,
    /// Processing-indicator timeout.
    pub processing_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            processing_timeout: PROCESSING_TIMEOUT,
        }
    }
}

/// The result of a successful handshake registration.
pub struct Registration {
    /// The registered connection.
    pub connection: Arc<ConnectionHandle>,
    /// Receiver the transport task drains to the peer.
    pub receiver: mpsc::Receiver<Envelope>,
    /// The session assigned to the connection.
    pub session_id: String,
    /// True when an earlier session was resumed.
    pub resumed: bool,
    /// Stored messages re-sent during session replay.
    pub replayed: u64,
}

/// A roster entry for observability surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSummary {
    /// Agent name.
    pub name: String,
    /// CLI tag.
    pub cli: Option<String>,
    /// Program tag.
    pub program: Option<String>,
    /// Model tag.
    pub model: Option<String>,
    /// Task description.
    pub task: Option<String>,
    /// Working directory.
    pub working_directory: Option<String>,
    /// Session id.
    pub session_id: String,
}

/// A "thinking" agent: DELIVERed to, no response yet.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessingInfo {
    /// Agent name.
    pub agent: String,
    /// The message that started the window.
    pub message_id: Uuid,
    /// Milliseconds spent processing so far.
    pub for_ms: u64,
}

struct ProcessingState {
    message_id: Uuid,
    started_at: Instant,
    timer: Option<JoinHandle<()>>,
}

impl Drop for ProcessingState {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    agents: HashMap<String, ConnectionId>,
    subscriptions: HashMap<String, HashSet<String>>,
    channels: HashMap<String, HashSet<String>>,
    channels_by_member: HashMap<String, HashSet<String>>,
    shadows_by_primary: HashMap<String, Vec<ShadowBinding>>,
    primary_by_shadow: HashMap<String, String>,
    pending: HashMap<Uuid, PendingDelivery>,
    processing: HashMap<String, ProcessingState>,
}

/// The routing hub. All in-memory maps are private to the router and
/// mutated under one lock; the store is the only durable resource.
pub struct Router {
    state: Mutex<RouterState>,
    store: Arc<dyn MessageStore>,
    policy: Option<Arc<PolicyEngine>>,
    gate: Option<Arc<SignatureGate>>,
    config: RouterConfig,
    events: broadcast::Sender<RouterEvent>,
}

impl Router {
    /// Creates a router over a message store.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: RouterConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(RouterState::default()),
            store,
            policy: None,
            gate: None,
            config,
            events,
        })
    }

    /// Creates a router with policy and signature gates installed.
    #[must_use]
    pub fn with_gates(
        store: Arc<dyn MessageStore>,
        config: RouterConfig,
        policy: Option<Arc<PolicyEngine>>,
        gate: Option<Arc<SignatureGate>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(RouterState::default()),
            store,
            policy,
            gate,
            config,
            events,
        })
    }

    /// Subscribes to router events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// The message store the router persists through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    // -----------------------------------------------------------------
    // Registration lifecycle
    // -----------------------------------------------------------------

    /// Registers an agent after its HELLO. Evicts any incumbent holder of
    /// the name, opens or resumes a session, and replays undelivered
    /// messages for resumed sessions.
    ///
    /// # Errors
    ///
    /// Fails only on storage errors; name eviction is not an error.
    pub async fn register(self: &Arc<Self>, hello: &HelloPayload) -> Result<Registration> {
        let agent = AgentInfo::from_hello(hello);

        // Resolve session resume before touching the address book.
        let resumed_session = self.resolve_session(hello, &agent.name).await?;
        let (session_id, resumed) = match &resumed_session {
            Some(session) => (session.id.clone(), true),
            None => (Uuid::new_v4().to_string(), false),
        };
        match resumed_session {
            Some(mut session) => {
                // Reopen the session row for the resumed connection.
                session.ended_at = None;
                session.closed_by = None;
                self.store.start_session(session).await?;
            }
            None => {
                let mut session =
                    Session::open(&session_id, &agent.name, relay_protocol::now_ms());
                session.cli = agent.cli.clone();
                session.resume_token = Some(Uuid::new_v4().simple().to_string());
                self.store.start_session(session).await?;
            }
        }

        let (connection, receiver) = create_connection(agent.clone(), session_id.clone());

        // Critical section: evict the incumbent and claim the name. The
        // evicted connection's subscriptions, shadows, pending entries, and
        // processing state all go before the name changes hands.
        let evicted_session = {
            let mut state = self.state.lock();
            let evicted = state.agents.get(&agent.name).cloned().map(|old_id| {
                info!(agent = %agent.name, "evicting prior connection for re-registered name");
                let old_session = state
                    .connections
                    .get(&old_id)
                    .map(|c| c.session_id.clone());
                Self::cleanup_locked(&mut state, &old_id);
                old_session
            });
            state.agents.insert(agent.name.clone(), connection.id.clone());
            state
                .connections
                .insert(connection.id.clone(), connection.clone());
            evicted
        };
        if evicted_session.is_some() {
            let _ = self.events.send(RouterEvent::AgentUnregistered {
                agent: agent.name.clone(),
                reason: "evicted".to_string(),
            });
        }
        // The evicted connection's session closes unless this registration
        // resumed it.
        if let Some(old_session) = evicted_session.flatten().filter(|s| *s != session_id) {
            if let Err(e) = self
                .store
                .end_session(&old_session, SessionCloseReason::Disconnect)
                .await
            {
                debug!(session = %old_session, error = %e, "evicted session close failed");
            }
        }

        info!(agent = %agent.name, session = %session_id, resumed, "agent registered");
        let _ = self.events.send(RouterEvent::AgentRegistered {
            agent: agent.name.clone(),
            session_id: session_id.clone(),
            resumed,
        });

        let mut replayed = 0;
        if resumed {
            let rows = self
                .store
                .get_pending_messages_for_session(&agent.name, &session_id)
                .await?;
            for row in rows {
                if self.replay_row(&connection, row) {
                    replayed += 1;
                }
            }
            if replayed > 0 {
                info!(agent = %agent.name, replayed, "session replay complete");
            }
        }

        Ok(Registration {
            connection,
            receiver,
            session_id,
            resumed,
            replayed,
        })
    }

    async fn resolve_session(
        &self,
        hello: &HelloPayload,
        agent_name: &str,
    ) -> Result<Option<Session>> {
        if let Some(session_id) = &hello.session_id {
            let session = self.store.get_session(session_id).await?;
            return Ok(session.filter(|s| s.agent_name == agent_name));
        }
        if let Some(token) = &hello.resume_token {
            let session = self.store.get_session_by_resume_token(token).await?;
            return Ok(session.filter(|s| s.agent_name == agent_name));
        }
        Ok(None)
    }

    /// Unregisters a connection: clears everything bound to it and closes
    /// its session. A connection that was already evicted only has its
    /// pending entries swept.
    pub async fn unregister(&self, connection_id: &str, reason: SessionCloseReason) {
        let session = {
            let mut state = self.state.lock();
            let current = state
                .connections
                .get(connection_id)
                .map(|c| (c.agent.name.clone(), c.session_id.clone()));
            Self::cleanup_locked(&mut state, connection_id);
            current
        };

        let Some((agent, session_id)) = session else {
            return;
        };

        if let Err(e) = self.store.end_session(&session_id, reason).await {
            debug!(session = %session_id, error = %e, "session close failed");
        }
        info!(agent = %agent, session = %session_id, reason = %reason, "agent unregistered");
        let _ = self.events.send(RouterEvent::AgentUnregistered {
            agent,
            reason: reason.to_string(),
        });
    }

    /// Removes every trace of a connection from the in-memory maps.
    fn cleanup_locked(state: &mut RouterState, connection_id: &str) {
        let Some(connection) = state.connections.remove(connection_id) else {
            // Unknown connection; still sweep pending entries bound to it.
            state.pending.retain(|_, p| p.connection_id != connection_id);
            return;
        };
        connection.close();
        let name = &connection.agent.name;

        if state.agents.get(name).map(String::as_str) == Some(connection_id) {
            state.agents.remove(name);

            state.subscriptions.retain(|_, members| {
                members.remove(name);
                !members.is_empty()
            });

            if let Some(channels) = state.channels_by_member.remove(name) {
                for channel in channels {
                    if let Some(members) = state.channels.get_mut(&channel) {
                        members.remove(name);
                        if members.is_empty() {
                            state.channels.remove(&channel);
                        }
                    }
                }
            }

            if let Some(bindings) = state.shadows_by_primary.remove(name) {
                for binding in bindings {
                    state.primary_by_shadow.remove(&binding.shadow);
                }
            }
            if let Some(primary) = state.primary_by_shadow.remove(name) {
                if let Some(bindings) = state.shadows_by_primary.get_mut(&primary) {
                    bindings.retain(|b| b.shadow != *name);
                    if bindings.is_empty() {
                        state.shadows_by_primary.remove(&primary);
                    }
                }
            }

            state.processing.remove(name);
        }

        // Dropping the entries aborts their retry timers.
        state.pending.retain(|_, p| p.connection_id != connection_id);
    }

    // -----------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------

    /// Handles one inbound envelope from a registered connection. Never
    /// propagates an error to the caller: failures are logged and the
    /// envelope is dropped.
    pub async fn handle_envelope(self: &Arc<Self>, connection_id: &str, envelope: Envelope) {
        let connection = self.state.lock().connections.get(connection_id).cloned();
        let Some(connection) = connection else {
            debug!(connection = %connection_id, "envelope from unknown connection dropped");
            return;
        };

        // Any traffic from the agent proves it is alive.
        self.clear_processing(&connection.agent.name);

        if matches!(
            envelope.kind,
            EnvelopeKind::Send | EnvelopeKind::ChannelMessage
        ) {
            if let Err(e) = self.gate_check(&envelope) {
                warn!(
                    agent = %connection.agent.name,
                    id = %envelope.id,
                    error = %e,
                    "envelope rejected by signature gate"
                );
                return;
            }
        }

        match envelope.kind {
            EnvelopeKind::Send => {
                // The registered identity wins over whatever `from` claims.
                let mut envelope = envelope;
                envelope.from = Some(connection.agent.name.clone());
                if let Err(e) = self.route_send(&envelope).await {
                    warn!(agent = %connection.agent.name, id = %envelope.id, error = %e, "send failed");
                }
            }
            EnvelopeKind::Ack => {
                if let Err(e) = self.handle_ack(&connection, &envelope).await {
                    debug!(agent = %connection.agent.name, error = %e, "ack ignored");
                }
            }
            EnvelopeKind::Subscribe => {
                if let Some(topic) = envelope.topic.as_deref() {
                    self.subscribe(&connection.agent.name, topic);
                }
            }
            EnvelopeKind::Unsubscribe => {
                if let Some(topic) = envelope.topic.as_deref() {
                    self.unsubscribe(&connection.agent.name, topic);
                }
            }
            EnvelopeKind::ChannelJoin => {
                if let Ok(payload) = envelope.channel_payload() {
                    self.channel_join(&connection.agent.name, &payload.channel);
                }
            }
            EnvelopeKind::ChannelLeave => {
                if let Ok(payload) = envelope.channel_payload() {
                    self.channel_leave(&connection.agent.name, &payload.channel);
                }
            }
            EnvelopeKind::ChannelMessage => {
                self.channel_message(&connection, &envelope);
            }
            EnvelopeKind::Ping => {
                let _ = connection.send(Envelope::pong(&envelope));
            }
            EnvelopeKind::Pong => {}
            EnvelopeKind::Hello | EnvelopeKind::HelloAck | EnvelopeKind::Deliver => {
                warn!(
                    agent = %connection.agent.name,
                    kind = %envelope.kind,
                    "unexpected envelope kind after handshake"
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // SEND routing
    // -----------------------------------------------------------------

    /// Routes a SEND whose `from` names the sender. Connections go through
    /// [`Self::handle_envelope`]; the daemon uses this directly for system
    /// messages (consensus announcements, cross-machine relays).
    ///
    /// # Errors
    ///
    /// Fails on malformed payloads or storage errors. An unknown recipient
    /// is a soft failure, not an error.
    pub async fn route_send(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let payload = envelope.send_payload()?;
        let sender_name = envelope.from.clone().unwrap_or_default();
        let target = envelope.to.clone().unwrap_or_default();

        if target == BROADCAST_TARGET {
            let recipients = self.broadcast_recipients(&sender_name, envelope.topic.as_deref());
            for recipient in recipients {
                if !self.message_allowed(&sender_name, &recipient.agent.name).await {
                    continue;
                }
                self.deliver_primary(&sender_name, &recipient, envelope, &payload)
                    .await?;
            }
            self.shadow_copies(&sender_name, envelope, &payload, ShadowDirection::Outgoing);
            return Ok(());
        }

        if !self.message_allowed(&sender_name, &target).await {
            // Policy denial is a soft failure: logged, not routed.
            return Ok(());
        }

        let recipient = {
            let state = self.state.lock();
            state
                .agents
                .get(&target)
                .and_then(|id| state.connections.get(id))
                .cloned()
        };
        let Some(recipient) = recipient else {
            let roster = {
                let state = self.state.lock();
                state.agents.keys().cloned().collect::<Vec<_>>().join(", ")
            };
            warn!(
                from = %sender_name,
                to = %target,
                roster = %roster,
                "unknown recipient; message dropped"
            );
            return Ok(());
        };

        self.deliver_primary(&sender_name, &recipient, envelope, &payload)
            .await?;

        // Shadow fan-out runs after the primary delivery.
        self.shadow_copies(&sender_name, envelope, &payload, ShadowDirection::Outgoing);
        self.shadow_copies(&target, envelope, &payload, ShadowDirection::Incoming);
        Ok(())
    }

    /// Applies the signature-verification policy to an inbound envelope.
    /// [`Self::handle_envelope`] runs this on every SEND and CHANNEL_MESSAGE;
    /// the daemon runs it on envelopes it consumes before routing (consensus
    /// commands), so nothing enters the system unverified.
    ///
    /// # Errors
    ///
    /// Returns the discriminated verification failure; the caller must drop
    /// the envelope.
    pub fn gate_check(&self, envelope: &Envelope) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.check(envelope)?;
        }
        Ok(())
    }

    fn broadcast_recipients(
        &self,
        sender: &str,
        topic: Option<&str>,
    ) -> Vec<Arc<ConnectionHandle>> {
        let state = self.state.lock();
        let names: Vec<String> = match topic {
            Some(topic) => state
                .subscriptions
                .get(topic)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default(),
            None => state.agents.keys().cloned().collect(),
        };
        names
            .into_iter()
            .filter(|name| name != sender)
            .filter_map(|name| {
                state
                    .agents
                    .get(&name)
                    .and_then(|id| state.connections.get(id))
                    .cloned()
            })
            .collect()
    }

    /// True when policy allows `sender` to message `recipient`; denials are
    /// logged. Applied to every routed SEND and to consensus commands the
    /// daemon consumes in `sender`'s name.
    pub async fn message_allowed(&self, sender: &str, recipient: &str) -> bool {
        let Some(policy) = &self.policy else {
            return true;
        };
        let decision = policy.can_message(sender, recipient).await;
        if !decision.allowed {
            warn!(
                from = %sender,
                to = %recipient,
                reason = %decision.reason,
                source = %decision.policy_source,
                "message denied by policy"
            );
        }
        decision.allowed
    }

    /// Builds, sends, tracks, and persists the DELIVER for one recipient.
    /// The row is persisted even when the outbound buffer was full, so the
    /// message replays after reconnect.
    async fn deliver_primary(
        self: &Arc<Self>,
        sender_name: &str,
        recipient: &Arc<ConnectionHandle>,
        envelope: &Envelope,
        payload: &SendPayload,
    ) -> Result<()> {
        let delivery = DeliveryInfo {
            seq: recipient.next_seq(envelope.topic.as_deref(), sender_name),
            session_id: recipient.session_id.clone(),
        };
        let deliver = Envelope::deliver_from(envelope, &recipient.agent.name, delivery.clone())?;
        let row = StoredMessage::from_send(envelope, payload, &recipient.agent.name, &delivery);

        self.dispatch_deliver(recipient, deliver, DispatchMode::Tracked);

        self.store.save_message(row).await?;
        let _ = self
            .store
            .increment_session_message_count(&recipient.session_id)
            .await;
        Ok(())
    }

    /// Re-sends a stored row as a DELIVER with its original id and sequence.
    fn replay_row(self: &Arc<Self>, connection: &Arc<ConnectionHandle>, row: StoredMessage) -> bool {
        let payload = SendPayload {
            kind: row.kind,
            body: row.body.clone(),
            data: row.data.clone(),
            thread: row.thread.clone(),
            importance: row.is_urgent.then_some(Importance::Urgent),
            reply_to: None,
        };
        let target = if row.is_broadcast {
            BROADCAST_TARGET.to_string()
        } else {
            row.to.clone()
        };
        let Ok(mut send) = Envelope::send(&row.from, &target, row.topic.as_deref(), &payload)
        else {
            return false;
        };
        send.id = row.id;
        send.ts = row.ts;

        let delivery = DeliveryInfo {
            seq: row.delivery_seq.unwrap_or(1),
            session_id: connection.session_id.clone(),
        };
        let Ok(deliver) = Envelope::deliver_from(&send, &row.to, delivery) else {
            return false;
        };
        self.dispatch_deliver(connection, deliver, DispatchMode::Tracked);
        true
    }

    /// Sends a DELIVER and, per mode, enters the pending table and marks the
    /// recipient processing.
    fn dispatch_deliver(
        self: &Arc<Self>,
        recipient: &Arc<ConnectionHandle>,
        deliver: Envelope,
        mode: DispatchMode,
    ) -> bool {
        let id = deliver.id;
        let seq = deliver
            .delivery_info()
            .map(|info| info.seq)
            .unwrap_or_default();
        let from = deliver.from.clone().unwrap_or_default();
        let sent = recipient.send(deliver.clone());

        match mode {
            DispatchMode::Tracked => {
                let timer = self.spawn_retry_timer(id);
                let mut state = self.state.lock();
                // Entry and timer go in together; ACK or cleanup removes both.
                state.pending.insert(
                    id,
                    PendingDelivery {
                        envelope: deliver,
                        connection_id: recipient.id.clone(),
                        attempts: 1,
                        first_sent_at: Instant::now(),
                        timer: Some(timer),
                    },
                );
                if sent {
                    self.set_processing_locked(&mut state, &recipient.agent.name, id);
                }
            }
            DispatchMode::Untracked => {}
            DispatchMode::ExpectResponse => {
                let mut state = self.state.lock();
                self.set_processing_locked(&mut state, &recipient.agent.name, id);
            }
        }

        if sent {
            debug!(id = %id, to = %recipient.agent.name, seq, "deliver dispatched");
            let _ = self.events.send(RouterEvent::Delivered {
                id,
                from,
                to: recipient.agent.name.clone(),
                seq,
            });
        } else {
            debug!(id = %id, to = %recipient.agent.name, "outbound buffer full; deferred to retry");
        }
        sent
    }

    // -----------------------------------------------------------------
    // Reliable delivery
    // -----------------------------------------------------------------

    fn spawn_retry_timer(self: &Arc<Self>, id: Uuid) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.retry.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(router) = weak.upgrade() {
                router.retry(id);
            }
        })
    }

    /// One retry tick for a pending delivery.
    fn retry(self: &Arc<Self>, id: Uuid) {
        let mut exhausted: Option<(String, u32)> = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.pending.get_mut(&id) else {
                return;
            };

            let ttl_expired =
                entry.first_sent_at.elapsed() > self.config.retry.delivery_ttl;
            let attempts_spent = entry.attempts >= self.config.retry.max_attempts;
            let connection = state.connections.get(&entry.connection_id).cloned();
            let alive = connection.is_some();

            if let Some(connection) = connection.filter(|_| !ttl_expired && !attempts_spent) {
                entry.attempts += 1;
                entry.timer = Some(self.spawn_retry_timer(id));
                let resend = entry.envelope.clone();
                debug!(
                    id = %id,
                    to = %connection.agent.name,
                    attempts = entry.attempts,
                    "resending deliver"
                );
                let _ = connection.send(resend);
            } else if let Some(entry) = state.pending.remove(&id) {
                if alive {
                    exhausted =
                        Some((entry.envelope.to.clone().unwrap_or_default(), entry.attempts));
                } else {
                    debug!(id = %id, "recipient connection gone; pending entry dropped");
                }
            }
        }

        if let Some((to, attempts)) = exhausted {
            warn!(id = %id, to = %to, attempts, "delivery exhausted; message remains stored unread");
            let _ = self.events.send(RouterEvent::DeliveryExhausted { id, to, attempts });
        }
    }

    async fn handle_ack(
        &self,
        connection: &Arc<ConnectionHandle>,
        envelope: &Envelope,
    ) -> Result<()> {
        let ack = envelope.ack_payload()?;

        let matched = {
            let mut state = self.state.lock();
            // Anti-spoof: only the connection the DELIVER went to may ACK.
            let matches = match state.pending.get(&ack.ack_id) {
                Some(entry) if entry.connection_id == connection.id => true,
                Some(_) => {
                    debug!(id = %ack.ack_id, from = %connection.agent.name, "ack from wrong connection ignored");
                    false
                }
                None => {
                    debug!(id = %ack.ack_id, "ack for unknown delivery ignored");
                    false
                }
            };
            if matches {
                state.pending.remove(&ack.ack_id);
            }
            matches
        };

        if matched {
            match self
                .store
                .update_message_status(ack.ack_id, MessageStatus::Acked)
                .await
            {
                Ok(()) | Err(StorageError::StatusRegression { .. }) => {}
                Err(StorageError::NotFound(_)) => {
                    debug!(id = %ack.ack_id, "acked message not in store");
                }
                Err(e) => return Err(e.into()),
            }
            let _ = self.events.send(RouterEvent::Acked {
                id: ack.ack_id,
                agent: connection.agent.name.clone(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Topics
    // -----------------------------------------------------------------

    /// Adds a session-scoped topic subscription.
    pub fn subscribe(&self, agent: &str, topic: &str) {
        let mut state = self.state.lock();
        state
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(agent.to_string());
        debug!(agent, topic, "subscribed");
    }

    /// Removes a subscription, garbage-collecting the empty topic.
    pub fn unsubscribe(&self, agent: &str, topic: &str) {
        let mut state = self.state.lock();
        if let Some(members) = state.subscriptions.get_mut(topic) {
            members.remove(agent);
            if members.is_empty() {
                state.subscriptions.remove(topic);
            }
        }
        debug!(agent, topic, "unsubscribed");
    }

    // -----------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------

    /// Adds a member to a channel and notifies existing members.
    pub fn channel_join(&self, agent: &str, channel: &str) {
        let notify = {
            let mut state = self.state.lock();
            let members = state.channels.entry(channel.to_string()).or_default();
            if !members.insert(agent.to_string()) {
                return;
            }
            let others: Vec<String> =
                members.iter().filter(|m| *m != agent).cloned().collect();
            state
                .channels_by_member
                .entry(agent.to_string())
                .or_default()
                .insert(channel.to_string());
            self.connections_for(&state, &others)
        };

        if let Ok(envelope) = Envelope::channel(
            EnvelopeKind::ChannelJoin,
            agent,
            &relay_protocol::ChannelPayload::membership(channel),
        ) {
            for member in notify {
                let _ = member.send(envelope.clone());
            }
        }
        debug!(agent, channel, "channel joined");
        let _ = self.events.send(RouterEvent::ChannelJoined {
            channel: channel.to_string(),
            member: agent.to_string(),
        });
    }

    /// Removes a member, garbage-collects the empty channel, and notifies
    /// the remaining members.
    pub fn channel_leave(&self, agent: &str, channel: &str) {
        let notify = {
            let mut state = self.state.lock();
            let Some(members) = state.channels.get_mut(channel) else {
                return;
            };
            if !members.remove(agent) {
                return;
            }
            if members.is_empty() {
                state.channels.remove(channel);
            }
            if let Some(channels) = state.channels_by_member.get_mut(agent) {
                channels.remove(channel);
                if channels.is_empty() {
                    state.channels_by_member.remove(agent);
                }
            }
            let remaining: Vec<String> = state
                .channels
                .get(channel)
                .map(|m| m.iter().cloned().collect())
                .unwrap_or_default();
            self.connections_for(&state, &remaining)
        };

        if let Ok(envelope) = Envelope::channel(
            EnvelopeKind::ChannelLeave,
            agent,
            &relay_protocol::ChannelPayload::membership(channel),
        ) {
            for member in notify {
                let _ = member.send(envelope.clone());
            }
        }
        debug!(agent, channel, "channel left");
        let _ = self.events.send(RouterEvent::ChannelLeft {
            channel: channel.to_string(),
            member: agent.to_string(),
        });
    }

    /// Fans a channel message out to all current members except the sender.
    fn channel_message(&self, sender: &Arc<ConnectionHandle>, envelope: &Envelope) {
        let Ok(payload) = envelope.channel_payload() else {
            warn!(from = %sender.agent.name, "malformed channel message dropped");
            return;
        };

        let recipients = {
            let state = self.state.lock();
            let Some(members) = state.channels.get(&payload.channel) else {
                debug!(channel = %payload.channel, "message to unknown channel dropped");
                return;
            };
            if !members.contains(&sender.agent.name) {
                debug!(
                    channel = %payload.channel,
                    from = %sender.agent.name,
                    "message from non-member dropped"
                );
                return;
            }
            let others: Vec<String> = members
                .iter()
                .filter(|m| **m != sender.agent.name)
                .cloned()
                .collect();
            self.connections_for(&state, &others)
        };

        for recipient in recipients {
            let mut copy = envelope.clone();
            copy.to = Some(recipient.agent.name.clone());
            let _ = recipient.send(copy);
        }
    }

    fn connections_for(
        &self,
        state: &RouterState,
        names: &[String],
    ) -> Vec<Arc<ConnectionHandle>> {
        names
            .iter()
            .filter_map(|name| {
                state
                    .agents
                    .get(name)
                    .and_then(|id| state.connections.get(id))
                    .cloned()
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Shadows
    // -----------------------------------------------------------------

    /// Binds a shadow to a primary, atomically replacing any prior binding
    /// of that shadow.
    pub fn bind_shadow(&self, primary: &str, binding: ShadowBinding) {
        let shadow = binding.shadow.clone();
        {
            let mut state = self.state.lock();
            if let Some(old_primary) = state
                .primary_by_shadow
                .insert(shadow.clone(), primary.to_string())
            {
                if let Some(bindings) = state.shadows_by_primary.get_mut(&old_primary) {
                    bindings.retain(|b| b.shadow != shadow);
                    if bindings.is_empty() {
                        state.shadows_by_primary.remove(&old_primary);
                    }
                }
            }
            let bindings = state
                .shadows_by_primary
                .entry(primary.to_string())
                .or_default();
            bindings.retain(|b| b.shadow != shadow);
            bindings.push(binding);
        }
        info!(primary, shadow = %shadow, "shadow bound");
        let _ = self.events.send(RouterEvent::ShadowBound {
            primary: primary.to_string(),
            shadow,
        });
    }

    /// Removes a shadow's binding.
    pub fn unbind_shadow(&self, shadow: &str) {
        let mut state = self.state.lock();
        if let Some(primary) = state.primary_by_shadow.remove(shadow) {
            if let Some(bindings) = state.shadows_by_primary.get_mut(&primary) {
                bindings.retain(|b| b.shadow != shadow);
                if bindings.is_empty() {
                    state.shadows_by_primary.remove(&primary);
                }
            }
        }
    }

    /// The primary an agent shadows, if any.
    #[must_use]
    pub fn primary_of(&self, shadow: &str) -> Option<String> {
        self.state.lock().primary_by_shadow.get(shadow).cloned()
    }

    /// Sends tagged copies of a routed message to a primary's shadows.
    /// Copies carry fresh envelope ids and are never tracked or persisted.
    fn shadow_copies(
        self: &Arc<Self>,
        primary: &str,
        envelope: &Envelope,
        payload: &SendPayload,
        direction: ShadowDirection,
    ) {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let state = self.state.lock();
            let Some(bindings) = state.shadows_by_primary.get(primary) else {
                return;
            };
            let names: Vec<String> = bindings
                .iter()
                .filter(|b| match direction {
                    ShadowDirection::Incoming => b.receive_incoming,
                    ShadowDirection::Outgoing => b.receive_outgoing,
                })
                .map(|b| b.shadow.clone())
                .collect();
            self.connections_for(&state, &names)
        };

        for shadow in targets {
            let mut copy_payload = payload.clone();
            copy_payload.set_data_value(SHADOW_COPY_KEY, serde_json::Value::Bool(true));
            copy_payload.set_data_value(
                SHADOW_OF_KEY,
                serde_json::Value::String(primary.to_string()),
            );
            copy_payload.set_data_value(
                SHADOW_DIRECTION_KEY,
                serde_json::Value::String(direction.to_string()),
            );

            let from = envelope.from.as_deref().unwrap_or_default();
            let Ok(copy) = Envelope::send(
                from,
                &shadow.agent.name,
                envelope.topic.as_deref(),
                &copy_payload,
            ) else {
                continue;
            };
            let delivery = DeliveryInfo {
                seq: shadow.next_seq(envelope.topic.as_deref(), from),
                session_id: shadow.session_id.clone(),
            };
            if let Ok(deliver) = Envelope::deliver_from(&copy, &shadow.agent.name, delivery) {
                self.dispatch_deliver(&shadow, deliver, DispatchMode::Untracked);
            }
        }
    }

    /// Delivers a synthetic trigger message to every shadow of `primary`
    /// whose binding fires on `trigger`, and marks those shadows processing.
    pub fn emit_shadow_trigger(
        self: &Arc<Self>,
        primary: &str,
        trigger: ShadowTrigger,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let state = self.state.lock();
            let Some(bindings) = state.shadows_by_primary.get(primary) else {
                return;
            };
            let names: Vec<String> = bindings
                .iter()
                .filter(|b| b.fires_on(trigger))
                .map(|b| b.shadow.clone())
                .collect();
            self.connections_for(&state, &names)
        };

        for shadow in targets {
            let mut payload = SendPayload::system(format!("SHADOW_TRIGGER:{trigger}"));
            payload.set_data_value(
                SHADOW_TRIGGER_KEY,
                serde_json::Value::String(trigger.to_string()),
            );
            if let Some(context) = &context {
                for (key, value) in context {
                    payload.set_data_value(key, value.clone());
                }
            }

            let Ok(send) = Envelope::send(primary, &shadow.agent.name, None, &payload) else {
                continue;
            };
            let delivery = DeliveryInfo {
                seq: shadow.next_seq(None, primary),
                session_id: shadow.session_id.clone(),
            };
            if let Ok(deliver) = Envelope::deliver_from(&send, &shadow.agent.name, delivery) {
                self.dispatch_deliver(&shadow, deliver, DispatchMode::ExpectResponse);
            }
        }
    }

    // -----------------------------------------------------------------
    // Processing state
    // -----------------------------------------------------------------

    fn set_processing_locked(self: &Arc<Self>, state: &mut RouterState, agent: &str, id: Uuid) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let agent_name = agent.to_string();
        let timeout = self.config.processing_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(router) = weak.upgrade() {
                router.processing_timed_out(&agent_name, id);
            }
        });
        state.processing.insert(
            agent.to_string(),
            ProcessingState {
                message_id: id,
                started_at: Instant::now(),
                timer: Some(timer),
            },
        );
    }

    fn clear_processing(&self, agent: &str) {
        self.state.lock().processing.remove(agent);
    }

    fn processing_timed_out(&self, agent: &str, message_id: Uuid) {
        let fired = {
            let mut state = self.state.lock();
            match state.processing.get(agent) {
                Some(entry) if entry.message_id == message_id => {
                    state.processing.remove(agent);
                    true
                }
                _ => false,
            }
        };
        if fired {
            debug!(agent, id = %message_id, "processing indicator timed out");
            let _ = self.events.send(RouterEvent::ProcessingTimeout {
                agent: agent.to_string(),
                message_id,
            });
        }
    }

    /// Agents currently marked processing.
    #[must_use]
    pub fn processing_agents(&self) -> Vec<ProcessingInfo> {
        self.state
            .lock()
            .processing
            .iter()
            .map(|(agent, entry)| ProcessingInfo {
                agent: agent.clone(),
                message_id: entry.message_id,
                for_ms: entry.started_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Observability accessors
    // -----------------------------------------------------------------

    /// The currently registered agents.
    #[must_use]
    pub fn roster(&self) -> Vec<AgentSummary> {
        let state = self.state.lock();
        let mut roster: Vec<AgentSummary> = state
            .connections
            .values()
            .filter(|c| state.agents.get(&c.agent.name).map(String::as_str) == Some(c.id.as_str()))
            .map(|c| AgentSummary {
                name: c.agent.name.clone(),
                cli: c.agent.cli.clone(),
                program: c.agent.program.clone(),
                model: c.agent.model.clone(),
                task: c.agent.task.clone(),
                working_directory: c.agent.working_directory.clone(),
                session_id: c.session_id.clone(),
            })
            .collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name));
        roster
    }

    /// Number of registered agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.state.lock().agents.len()
    }

    /// Number of in-flight (unACKed) deliveries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Members of a channel.
    #[must_use]
    pub fn channel_members(&self, channel: &str) -> Vec<String> {
        self.state
            .lock()
            .channels
            .get(channel)
            .map(|members| {
                let mut names: Vec<String> = members.iter().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }
}

/// How a DELIVER dispatch is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// Pending table + retry timer + processing indicator.
    Tracked,
    /// Fire-and-forget (shadow copies).
    Untracked,
    /// No retry tracking, but the recipient is marked processing
    /// (shadow triggers expect a response).
    ExpectResponse,
}
