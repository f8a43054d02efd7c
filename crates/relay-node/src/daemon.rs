//! The per-workspace daemon: store, router, consensus, cloud bridge, and
//! the Unix-socket and WebSocket transports.

use crate::config::{DaemonConfig, StorageType};
use crate::error::Result;
use crate::metrics::RelayMetrics;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_cloud::{CloudEvent, CloudSync, CloudSyncConfig, LocalAgent, LocalRoster};
use relay_consensus::{
    format_announcement, format_result, parse_command, ConsensusCommand, ConsensusEngine,
    ConsensusEvent,
};
use relay_policy::{PolicyEngine, PolicySettings};
use relay_protocol::{
    decode_frame, encode_frame, Envelope, EnvelopeKind, HelloAckPayload, SendPayload,
    BROADCAST_TARGET,
};
use relay_router::{AgentSummary, ConnectionHandle, Registration, Router, RouterConfig};
use relay_signing::{KeyStore, SignatureGate, SigningConfig};
use relay_storage::{
    BatchConfig, BatchedStore, MemoryStore, MessageStore, SessionCloseReason, SqliteStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The reserved sender name for daemon-originated messages.
pub const SYSTEM_AGENT: &str = "consensus";

/// Directory a workspace's relay state lives under.
pub const RELAY_DIR: &str = ".agent-relay";

/// One workspace's relay daemon.
pub struct Daemon {
    workspace_dir: PathBuf,
    socket_path: PathBuf,
    store: Arc<dyn MessageStore>,
    router: Arc<Router>,
    consensus: Arc<ConsensusEngine>,
    cloud: Option<Arc<CloudSync>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct RouterRoster(Arc<Router>);

impl LocalRoster for RouterRoster {
    fn agents(&self) -> Vec<LocalAgent> {
        self.0
            .roster()
            .into_iter()
            .map(|agent| LocalAgent {
                name: agent.name,
                cli: agent.cli,
            })
            .collect()
    }
}

impl Daemon {
    /// Builds and starts a daemon for one workspace: opens the store, wires
    /// the gates, starts the consensus and cloud loops, and binds the Unix
    /// socket listener.
    ///
    /// # Errors
    ///
    /// Fails when the store, key material, policy files, or socket cannot
    /// be initialized.
    pub async fn start(
        config: &DaemonConfig,
        workspace_dir: &Path,
        metrics: &Arc<RelayMetrics>,
    ) -> Result<Arc<Self>> {
        let relay_dir = workspace_dir.join(RELAY_DIR);
        std::fs::create_dir_all(&relay_dir)?;

        let store: Arc<dyn MessageStore> = match config.storage.storage_type {
            StorageType::Memory => Arc::new(MemoryStore::new()),
            StorageType::Sqlite => {
                let path = config
                    .storage
                    .path
                    .clone()
                    .unwrap_or_else(|| relay_dir.join("messages.db"));
                let sqlite = SqliteStore::open(&path)?;
                BatchedStore::new(sqlite, BatchConfig::default())
            }
        };
        metrics.watch_store(&store);

        let keys = KeyStore::open(&config.keys_dir())?;
        let signing = SigningConfig::load(&config.data_dir)?;
        let gate = Arc::new(SignatureGate::new(signing, keys));

        let policy = Arc::new(PolicyEngine::from_paths(
            Some(&workspace_dir.join("agent-policies.yaml")),
            Some(&config.policies_dir()),
            None,
            PolicySettings::default(),
        )?);

        let router = Router::with_gates(
            store.clone(),
            RouterConfig::default(),
            Some(policy),
            Some(gate),
        );
        metrics.watch_router(router.subscribe_events());

        let (consensus, consensus_events) = ConsensusEngine::new();

        let cloud = match &config.cloud {
            Some(cloud_config) => {
                let machine_id = relay_cloud::load_or_create_machine_id(&config.data_dir)?;
                let (sync, events) = CloudSync::new(
                    CloudSyncConfig::new(&cloud_config.url, &cloud_config.api_key),
                    machine_id,
                    Arc::new(RouterRoster(router.clone())),
                );
                sync.start();
                Some((sync, events))
            }
            None => None,
        };

        let socket_path = relay_dir.join("relay.sock");
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;

        let daemon = Arc::new(Self {
            workspace_dir: workspace_dir.to_path_buf(),
            socket_path,
            store,
            router,
            consensus,
            cloud: cloud.as_ref().map(|(sync, _)| sync.clone()),
            tasks: Mutex::new(Vec::new()),
        });

        daemon.spawn_consensus_task(consensus_events);
        if let Some((_, cloud_events)) = cloud {
            daemon.spawn_cloud_task(cloud_events);
        }
        daemon.spawn_accept_loop(listener);

        info!(
            workspace = %daemon.workspace_dir.display(),
            socket = %daemon.socket_path.display(),
            "daemon started"
        );
        Ok(daemon)
    }

    /// The workspace this daemon serves.
    #[must_use]
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// The Unix socket agents connect to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The daemon's router.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The daemon's consensus engine.
    #[must_use]
    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    /// The registered agents.
    #[must_use]
    pub fn roster(&self) -> Vec<AgentSummary> {
        self.router.roster()
    }

    /// Stops the daemon: cloud loop, background tasks, a final store flush,
    /// and the socket file.
    pub async fn shutdown(&self) {
        if let Some(cloud) = &self.cloud {
            cloud.stop();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "store close failed");
        }
        let _ = std::fs::remove_file(&self.socket_path);
        info!(workspace = %self.workspace_dir.display(), "daemon stopped");
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: UnixListener) {
        let daemon = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            daemon.serve_unix(stream).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        return;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    // -----------------------------------------------------------------
    // Unix socket transport
    // -----------------------------------------------------------------

    async fn serve_unix(self: &Arc<Self>, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Handshake: the first frame must be a HELLO.
        let hello = match lines.next_line().await {
            Ok(Some(line)) => match decode_frame(&line).and_then(|e| e.hello_payload()) {
                Ok(hello) => hello,
                Err(e) => {
                    warn!(error = %e, "handshake rejected");
                    return;
                }
            },
            _ => return,
        };

        let registration = match self.router.register(&hello).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(agent = %hello.agent_name, error = %e, "registration failed");
                return;
            }
        };

        let ack = HelloAckPayload {
            session_id: registration.session_id.clone(),
            pending_replay: (registration.replayed > 0).then_some(registration.replayed),
        };
        let Ok(ack) = Envelope::hello_ack(&ack).and_then(|e| encode_frame(&e)) else {
            self.router
                .unregister(&registration.connection.id, SessionCloseReason::Error)
                .await;
            return;
        };
        if write_half.write_all(ack.as_bytes()).await.is_err() {
            self.router
                .unregister(&registration.connection.id, SessionCloseReason::Error)
                .await;
            return;
        }

        let Registration {
            connection,
            mut receiver,
            ..
        } = registration;

        // Writer task: drain the outbound buffer onto the socket.
        let writer = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Ok(frame) = encode_frame(&envelope) else {
                    continue;
                };
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let reason = loop {
            tokio::select! {
                () = connection.closed() => {
                    // Evicted by a newer registration for the same name.
                    break None;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_frame(&line) {
                            Ok(envelope) => self.handle_inbound(&connection, envelope).await,
                            Err(e) => {
                                warn!(agent = %connection.agent.name, error = %e, "invalid frame; closing");
                                break Some(SessionCloseReason::Error);
                            }
                        }
                    }
                    Ok(None) => break Some(SessionCloseReason::Disconnect),
                    Err(_) => break Some(SessionCloseReason::Error),
                }
            }
        };

        if let Some(reason) = reason {
            self.router.unregister(&connection.id, reason).await;
        }
        writer.abort();
    }

    // -----------------------------------------------------------------
    // WebSocket transport
    // -----------------------------------------------------------------

    /// Serves one agent over a WebSocket, one text frame per envelope.
    pub async fn serve_ws(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let hello = loop {
            match ws_rx.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    match decode_frame(text.as_str()).and_then(|e| e.hello_payload()) {
                        Ok(hello) => break hello,
                        Err(e) => {
                            warn!(error = %e, "ws handshake rejected");
                            return;
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                _ => return,
            }
        };

        let registration = match self.router.register(&hello).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(agent = %hello.agent_name, error = %e, "ws registration failed");
                return;
            }
        };

        let ack = HelloAckPayload {
            session_id: registration.session_id.clone(),
            pending_replay: (registration.replayed > 0).then_some(registration.replayed),
        };
        let Ok(frame) = Envelope::hello_ack(&ack).and_then(|e| encode_frame(&e)) else {
            self.router
                .unregister(&registration.connection.id, SessionCloseReason::Error)
                .await;
            return;
        };
        if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
            self.router
                .unregister(&registration.connection.id, SessionCloseReason::Error)
                .await;
            return;
        }

        let Registration {
            connection,
            mut receiver,
            ..
        } = registration;

        let writer = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let Ok(frame) = encode_frame(&envelope) else {
                    continue;
                };
                if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                    return;
                }
            }
        });

        let reason = loop {
            tokio::select! {
                () = connection.closed() => break None,
                message = ws_rx.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => match decode_frame(text.as_str()) {
                        Ok(envelope) => self.handle_inbound(&connection, envelope).await,
                        Err(e) => {
                            warn!(agent = %connection.agent.name, error = %e, "invalid ws frame; closing");
                            break Some(SessionCloseReason::Error);
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break Some(SessionCloseReason::Disconnect),
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break Some(SessionCloseReason::Error),
                }
            }
        };

        if let Some(reason) = reason {
            self.router.unregister(&connection.id, reason).await;
        }
        writer.abort();
    }

    // -----------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------

    /// Routes an inbound envelope, intercepting consensus text commands.
    /// Intercepted commands pass the same signature gate and message policy
    /// a routed SEND would; a command that fails either check is dropped the
    /// same way the router drops the envelope.
    async fn handle_inbound(self: &Arc<Self>, connection: &Arc<ConnectionHandle>, envelope: Envelope) {
        if envelope.kind == EnvelopeKind::Send {
            if let Ok(payload) = envelope.send_payload() {
                if let Some(parsed) = parse_command(&payload.body) {
                    let agent = connection.agent.name.clone();
                    if let Err(e) = self.router.gate_check(&envelope) {
                        warn!(
                            agent = %agent,
                            id = %envelope.id,
                            error = %e,
                            "consensus command rejected by signature gate"
                        );
                        return;
                    }
                    let target = envelope.to.clone().unwrap_or_default();
                    if !self.router.message_allowed(&agent, &target).await {
                        return;
                    }
                    match parsed {
                        Ok(command) => self.handle_consensus_command(&agent, command).await,
                        Err(e) => {
                            self.system_send(&agent, &format!("Consensus error: {e}"), None)
                                .await;
                        }
                    }
                    return;
                }
            }
        }
        self.router.handle_envelope(&connection.id, envelope).await;
    }

    async fn handle_consensus_command(self: &Arc<Self>, agent: &str, command: ConsensusCommand) {
        let outcome = match command {
            ConsensusCommand::Propose(parts) => self
                .consensus
                .create_proposal(parts.into_request(agent))
                .map(|proposal| {
                    debug!(proposal = %proposal.id, proposer = %agent, "proposal accepted");
                }),
            ConsensusCommand::Vote {
                proposal_id,
                value,
                reason,
            } => self
                .consensus
                .cast_vote(&proposal_id, agent, value, reason)
                .map(|_| ()),
            ConsensusCommand::Cancel { proposal_id } => {
                self.consensus.cancel(&proposal_id, agent).map(|_| ())
            }
        };

        if let Err(e) = outcome {
            self.system_send(agent, &format!("Consensus error: {e}"), None)
                .await;
        }
    }

    /// Routes a system message from the reserved consensus sender.
    async fn system_send(&self, to: &str, body: &str, thread: Option<&str>) {
        let mut payload = SendPayload::system(body);
        payload.thread = thread.map(str::to_string);
        let Ok(envelope) = Envelope::send(SYSTEM_AGENT, to, None, &payload) else {
            return;
        };
        if let Err(e) = self.router.route_send(&envelope).await {
            debug!(to, error = %e, "system send failed");
        }
    }

    fn spawn_consensus_task(
        self: &Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<ConsensusEvent>,
    ) {
        let daemon = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConsensusEvent::Created { proposal } => {
                        let announcement = format_announcement(&proposal);
                        for participant in &proposal.participants {
                            daemon
                                .system_send(participant, &announcement, Some(&proposal.thread))
                                .await;
                        }
                    }
                    ConsensusEvent::Resolved { proposal, tally } => {
                        let result = format_result(&proposal, &tally);
                        daemon
                            .system_send(BROADCAST_TARGET, &result, Some(&proposal.thread))
                            .await;
                    }
                    ConsensusEvent::Cancelled { proposal } => {
                        let notice = format!(
                            "Proposal {} ({}) cancelled by {}",
                            proposal.id, proposal.title, proposal.proposer
                        );
                        daemon
                            .system_send(BROADCAST_TARGET, &notice, Some(&proposal.thread))
                            .await;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_cloud_task(
        self: &Arc<Self>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<CloudEvent>,
    ) {
        let daemon = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CloudEvent::CrossMachineMessage(message) => {
                        let mut payload = SendPayload::message(&message.body);
                        payload.thread = message.thread.clone();
                        let Ok(envelope) =
                            Envelope::send(&message.from, &message.to, None, &payload)
                        else {
                            continue;
                        };
                        if let Err(e) = daemon.router.route_send(&envelope).await {
                            debug!(to = %message.to, error = %e, "cross-machine relay failed");
                        }
                    }
                    CloudEvent::Command(command) => {
                        info!(command = %command.command, id = %command.id, "cloud command received");
                    }
                    CloudEvent::RemoteAgentsUpdated(agents) => {
                        debug!(count = agents.len(), "remote agent roster updated");
                    }
                    CloudEvent::Connected => info!("cloud bridge connected"),
                    CloudEvent::Disconnected => warn!("cloud bridge disconnected (auth)"),
                    CloudEvent::Error(e) => debug!(error = %e, "cloud bridge error"),
                    CloudEvent::CredentialsUpdated(_) => info!("cloud credentials refreshed"),
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use relay_protocol::HelloPayload;

    fn test_config(dir: &Path) -> DaemonConfig {
        DaemonConfig {
            data_dir: dir.join("data"),
            config_dir: dir.join("config"),
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                path: None,
                url: None,
            },
            cloud: None,
        }
    }

    #[tokio::test]
    async fn daemon_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = RelayMetrics::new();
        let daemon = Daemon::start(&test_config(dir.path()), dir.path(), &metrics)
            .await
            .unwrap();

        assert!(daemon.socket_path().exists());
        assert!(daemon.roster().is_empty());

        daemon.shutdown().await;
        assert!(!daemon.socket_path().exists());
    }

    #[tokio::test]
    async fn unix_socket_handshake_and_send() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = RelayMetrics::new();
        let daemon = Daemon::start(&test_config(dir.path()), dir.path(), &metrics)
            .await
            .unwrap();

        // Bob connects directly through the router; Alice over the socket.
        let mut bob = daemon
            .router()
            .register(&HelloPayload::new("bob"))
            .await
            .unwrap();

        let stream = UnixStream::connect(daemon.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let hello = Envelope::hello(&HelloPayload::new("alice")).unwrap();
        write_half
            .write_all(encode_frame(&hello).unwrap().as_bytes())
            .await
            .unwrap();

        let ack_line = lines.next_line().await.unwrap().unwrap();
        let ack = decode_frame(&ack_line).unwrap();
        assert_eq!(ack.kind, EnvelopeKind::HelloAck);

        let send = Envelope::send("alice", "bob", None, &SendPayload::message("over the wire"))
            .unwrap();
        write_half
            .write_all(encode_frame(&send).unwrap().as_bytes())
            .await
            .unwrap();

        let deliver = bob.receiver.recv().await.unwrap();
        assert_eq!(deliver.kind, EnvelopeKind::Deliver);
        assert_eq!(deliver.send_payload().unwrap().body, "over the wire");

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn consensus_command_intercepted_not_routed() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = RelayMetrics::new();
        let daemon = Daemon::start(&test_config(dir.path()), dir.path(), &metrics)
            .await
            .unwrap();

        let alice = daemon
            .router()
            .register(&HelloPayload::new("alice"))
            .await
            .unwrap();
        let mut bob = daemon
            .router()
            .register(&HelloPayload::new("bob"))
            .await
            .unwrap();

        let propose = Envelope::send(
            "alice",
            "bob",
            None,
            &SendPayload::message("PROPOSE majority participants=alice,bob :: Adopt rustfmt"),
        )
        .unwrap();
        daemon.handle_inbound(&alice.connection, propose).await;

        // The proposal exists and bob got the announcement, not the raw SEND.
        assert_eq!(daemon.consensus().pending().len(), 1);
        let announcement = bob.receiver.recv().await.unwrap();
        let payload = announcement.send_payload().unwrap();
        assert!(payload.body.contains("Proposal"));
        assert_eq!(announcement.from.as_deref(), Some(SYSTEM_AGENT));

        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn policy_denied_consensus_command_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        // Repo policy: alice may only message bob, so a command addressed
        // anywhere else is refused before the engine sees it.
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("agent-policies.yaml"),
            "alice:\n  canMessage: [bob]\n",
        )
        .unwrap();

        let metrics = RelayMetrics::new();
        let daemon = Daemon::start(&test_config(dir.path()), dir.path(), &metrics)
            .await
            .unwrap();

        let alice = daemon
            .router()
            .register(&HelloPayload::new("alice"))
            .await
            .unwrap();

        let propose = Envelope::send(
            "alice",
            "carol",
            None,
            &SendPayload::message("PROPOSE majority participants=alice,carol :: Sneak one in"),
        )
        .unwrap();
        daemon.handle_inbound(&alice.connection, propose).await;
        assert!(daemon.consensus().pending().is_empty());

        // The same command to an allowed recipient goes through.
        let propose = Envelope::send(
            "alice",
            "bob",
            None,
            &SendPayload::message("PROPOSE majority participants=alice,bob :: Allowed one"),
        )
        .unwrap();
        daemon.handle_inbound(&alice.connection, propose).await;
        assert_eq!(daemon.consensus().pending().len(), 1);

        daemon.shutdown().await;
    }
}
