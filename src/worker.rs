//! The background tick loop: the single task that owns the consensus
//! engine, the one place durable writes, outbound sends and state machine
//! applies happen, always in that order for a given batch of effects.

use crate::config::Config;
use crate::engine::{Effect, RaftEngine};
use crate::error::{RaftError, Result};
use crate::log::{ConfChangeOp, EntryKind, LogEntry};
use crate::state_machine::KvStateMachine;
use crate::storage::{ClusterConfiguration, Storage};
use crate::transport::tcp::{self, Outbound, TcpConfig};
use crate::transport::{HandshakePreamble, Message};
use crate::types::{ClusterName, LogIndex, NodeId, Term, WorkerState};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// The read-only view SQL-facing callers poll; swapped atomically by the
/// worker on every tick that changes it, never mutated in place.
#[derive(Debug, Clone)]
pub struct PublishedState {
    pub node_id: NodeId,
    pub role: crate::types::Role,
    pub current_term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<NodeId>,
    pub configuration: ClusterConfiguration,
    pub worker_state: WorkerState,
}

pub enum WorkerCommand {
    Propose {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<LogIndex>>,
    },
    ProposeConfChange {
        op: ConfChangeOp,
        respond_to: oneshot::Sender<Result<LogIndex>>,
    },
    ReadIndex {
        respond_to: oneshot::Sender<Result<LogIndex>>,
    },
    KvGet {
        key: Vec<u8>,
        respond_to: oneshot::Sender<Option<Vec<u8>>>,
    },
    SetDebug {
        enabled: bool,
    },
}

/// Handle cloned into every caller; the only way to reach the worker.
#[derive(Clone)]
pub struct WorkerHandle {
    command_tx: mpsc::Sender<WorkerCommand>,
    published: Arc<ArcSwap<PublishedState>>,
}

impl WorkerHandle {
    pub fn published(&self) -> Arc<PublishedState> {
        self.published.load_full()
    }

    async fn send(&self, command: WorkerCommand) -> Result<()> {
        self.command_tx
            .try_send(command)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RaftError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => RaftError::Shutdown,
            })
    }

    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WorkerCommand::Propose { data, respond_to }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn propose_conf_change(&self, op: ConfChangeOp) -> Result<LogIndex> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WorkerCommand::ProposeConfChange { op, respond_to }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn read_index(&self) -> Result<LogIndex> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WorkerCommand::ReadIndex { respond_to }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn kv_get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let (respond_to, rx) = oneshot::channel();
        self.send(WorkerCommand::KvGet { key, respond_to }).await?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    pub async fn set_debug(&self, enabled: bool) -> Result<()> {
        self.send(WorkerCommand::SetDebug { enabled }).await
    }
}

struct PeerLink {
    outbound_tx: mpsc::Sender<Outbound>,
    next_message_id: u64,
}

pub struct Worker {
    engine: RaftEngine,
    storage: Arc<dyn Storage>,
    state_machine: KvStateMachine,
    peers: HashMap<NodeId, PeerLink>,
    published: Arc<ArcSwap<PublishedState>>,
    command_rx: mpsc::Receiver<WorkerCommand>,
    inbound_rx: mpsc::Receiver<(NodeId, Message)>,
    pending_reads: HashMap<u64, oneshot::Sender<Result<LogIndex>>>,
    log_reload_handle: Option<tracing_subscriber::reload::Handle<tracing_subscriber::filter::LevelFilter, tracing_subscriber::Registry>>,
    shutdown_rx: mpsc::Receiver<()>,
    tcp_config: TcpConfig,
    cluster_name: ClusterName,
    peer_queue_capacity: usize,
    worker_state: WorkerState,
}

impl Worker {
    /// Starts the worker task, wiring up storage, transport and the tick
    /// loop. Returns a `WorkerHandle` for the control surface and a
    /// shutdown sender for cooperative stop.
    pub async fn spawn(
        config: Config,
        storage: Arc<dyn Storage>,
    ) -> Result<(WorkerHandle, mpsc::Sender<()>)> {
        let loaded = storage.load_all().await?;
        let mut configuration = loaded
            .snapshot
            .as_ref()
            .map(|s| s.configuration.clone())
            .unwrap_or_else(|| {
                ClusterConfiguration::new(
                    config
                        .peers
                        .iter()
                        .map(|p| p.node_id)
                        .chain(std::iter::once(config.node_id)),
                )
            });
        if configuration.endpoint(config.node_id).is_none() {
            configuration.set_endpoint(
                config.node_id,
                crate::types::Endpoint {
                    host: config.bind_addr.ip().to_string(),
                    port: config.bind_addr.port(),
                },
            );
        }
        for peer in &config.peers {
            if configuration.endpoint(peer.node_id).is_none() {
                configuration.set_endpoint(
                    peer.node_id,
                    crate::types::Endpoint {
                        host: peer.addr.ip().to_string(),
                        port: peer.addr.port(),
                    },
                );
            }
        }

        let mut log = crate::log::RaftLog::new(
            loaded
                .snapshot
                .as_ref()
                .map(|s| s.included_index + 1)
                .unwrap_or(1),
        );
        log.append_entries(&loaded.entries);

        let mut state_machine = KvStateMachine::new();
        if let Some(snapshot) = &loaded.snapshot {
            state_machine.restore(snapshot);
        }
        // Anything committed but not yet applied before a crash must be
        // replayed once the tick loop starts, so `last_applied` starts at
        // the snapshot's included index, never at `commit_index`.
        let last_applied = loaded.snapshot.as_ref().map(|s| s.included_index).unwrap_or(0);

        let now = std::time::Instant::now();
        let engine = RaftEngine::new(
            config.node_id,
            configuration.clone(),
            config.election_timeout_range(),
            config.heartbeat_interval(),
            config.snapshot_threshold,
            config.max_entries_per_append,
            loaded.hard_state,
            log,
            last_applied,
            now,
        );

        let published = Arc::new(ArcSwap::from_pointee(PublishedState {
            node_id: config.node_id,
            role: engine.role,
            current_term: engine.current_term,
            commit_index: engine.commit_index,
            last_applied: engine.last_applied,
            leader_id: engine.leader_id,
            configuration,
            worker_state: WorkerState::Starting,
        }));

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.command_queue_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let cluster_name = ClusterName::new(config.cluster_name.clone())
            .map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        let tcp_config = TcpConfig::from(&config);

        let mut peers = HashMap::new();
        for peer in &config.peers {
            let (outbound_tx, outbound_rx) = mpsc::channel(config.command_queue_capacity);
            let preamble = HandshakePreamble {
                cluster_name: cluster_name.clone(),
                node_id: config.node_id,
                term_hint: engine.current_term,
            };
            tokio::spawn(tcp::run_peer_sender(
                peer.node_id,
                peer.addr,
                tcp_config.clone(),
                preamble,
                outbound_rx,
            ));
            peers.insert(
                peer.node_id,
                PeerLink {
                    outbound_tx,
                    next_message_id: 0,
                },
            );
        }

        tokio::spawn(accept_loop(tcp_config.clone(), cluster_name.clone(), inbound_tx));

        let worker = Worker {
            engine,
            storage,
            state_machine,
            peers,
            published: published.clone(),
            command_rx,
            inbound_rx,
            pending_reads: HashMap::new(),
            log_reload_handle: None,
            shutdown_rx,
            tcp_config,
            cluster_name,
            peer_queue_capacity: config.command_queue_capacity,
            worker_state: WorkerState::Starting,
        };
        let tick_interval = config.tick_interval();

        tokio::spawn(worker.run(tick_interval));

        Ok((
            WorkerHandle {
                command_tx,
                published,
            },
            shutdown_tx,
        ))
    }

    async fn run(mut self, tick_interval: std::time::Duration) {
        self.worker_state = WorkerState::Running;
        self.publish_state();
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            let result = tokio::select! {
                _ = interval.tick() => {
                    let effects = self.engine.tick(std::time::Instant::now());
                    self.process_effects(effects).await
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await
                }
                Some((from, message)) = self.inbound_rx.recv() => {
                    let effects = self.engine.handle_message(from, message, std::time::Instant::now());
                    self.process_effects(effects).await
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!(node_id = self.engine.node_id, "worker shutting down");
                    self.worker_state = WorkerState::Stopping;
                    self.fail_pending_reads();
                    self.worker_state = WorkerState::Stopped;
                    self.publish_state();
                    return;
                }
            };
            if let Err(e) = result {
                // Safety-fatal: a storage write we can no longer trust to
                // have happened means the log and what we've told peers may
                // have diverged. Stop rather than keep replying to commands.
                tracing::error!(
                    node_id = self.engine.node_id,
                    error = %e,
                    "worker stopping after unrecoverable storage failure"
                );
                self.worker_state = WorkerState::Stopping;
                self.fail_pending_reads();
                self.worker_state = WorkerState::Stopped;
                self.publish_state();
                return;
            }
            self.publish_state();
        }
    }

    fn fail_pending_reads(&mut self) {
        for (_, tx) in self.pending_reads.drain() {
            let _ = tx.send(Err(RaftError::Shutdown));
        }
    }

    /// Returns `Err` only for the command itself failing to apply a fatal
    /// storage effect; `run`'s caller treats that as the signal to stop.
    async fn handle_command(&mut self, command: WorkerCommand) -> Result<()> {
        match command {
            WorkerCommand::Propose { data, respond_to } => match self.engine.propose(data) {
                Ok((index, effects)) => match self.process_effects(effects).await {
                    Ok(()) => {
                        let _ = respond_to.send(Ok(index));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e.clone()));
                        Err(e)
                    }
                },
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    Ok(())
                }
            },
            WorkerCommand::ProposeConfChange { op, respond_to } => match self.engine.propose_conf_change(op) {
                Ok((index, effects)) => match self.process_effects(effects).await {
                    Ok(()) => {
                        let _ = respond_to.send(Ok(index));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(e.clone()));
                        Err(e)
                    }
                },
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    Ok(())
                }
            },
            WorkerCommand::ReadIndex { respond_to } => match self.engine.request_read_index() {
                Ok((token, effects)) => {
                    self.pending_reads.insert(token, respond_to);
                    if let Err(e) = self.process_effects(effects).await {
                        if let Some(tx) = self.pending_reads.remove(&token) {
                            let _ = tx.send(Err(e.clone()));
                        }
                        return Err(e);
                    }
                    Ok(())
                }
                Err(e) => {
                    let _ = respond_to.send(Err(e));
                    Ok(())
                }
            },
            WorkerCommand::KvGet { key, respond_to } => {
                let _ = respond_to.send(self.state_machine.get(&key).cloned());
                Ok(())
            }
            WorkerCommand::SetDebug { enabled } => {
                if let Some(handle) = &self.log_reload_handle {
                    let level = if enabled {
                        tracing_subscriber::filter::LevelFilter::DEBUG
                    } else {
                        tracing_subscriber::filter::LevelFilter::INFO
                    };
                    let _ = handle.modify(|filter| *filter = level);
                }
                Ok(())
            }
        }
    }

    /// Classifies a storage result: safety-fatal errors propagate and stop
    /// the batch (the caller stops the worker loop entirely); anything else
    /// is logged and treated as recovered, matching the engine's liveness-
    /// transient / safety-fatal split.
    fn handle_storage_result(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                tracing::error!(node_id = self.engine.node_id, error = %e, "fatal storage failure");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(node_id = self.engine.node_id, error = %e, "storage effect failed, continuing");
                Ok(())
            }
        }
    }

    /// Applies every effect from one tick/message/command in order,
    /// persisting before sending or applying. Stops at the first
    /// safety-fatal storage error instead of carrying on with an engine
    /// state the caller was never told is unpersisted.
    async fn process_effects(&mut self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::PersistHardState(state) => {
                    self.handle_storage_result(self.storage.save_hard_state(&state).await)?;
                }
                Effect::AppendLog(entries) => {
                    self.handle_storage_result(self.storage.append(&entries).await)?;
                }
                Effect::TruncateLog(index) => {
                    self.handle_storage_result(self.storage.truncate_from(index).await)?;
                }
                Effect::PersistSnapshot(mut snapshot) => {
                    if snapshot.state_blob.is_empty() {
                        snapshot = self
                            .state_machine
                            .snapshot(snapshot.configuration.clone(), snapshot.included_term);
                    }
                    self.handle_storage_result(self.storage.save_snapshot(&snapshot).await)?;
                    self.handle_storage_result(self.storage.compact_log(snapshot.included_index).await)?;
                }
                Effect::CompactLog(index) => {
                    self.handle_storage_result(self.storage.compact_log(index).await)?;
                }
                Effect::Send { to, message } => {
                    let message = self.fill_snapshot_blob(message);
                    self.send_to_peer(to, message);
                }
                Effect::Apply { entries } => {
                    self.reconcile_transport(&entries);
                    self.state_machine.apply_entries(&entries);
                }
                Effect::ReadReady { token, at_index } => {
                    if self.state_machine.applied_index() >= at_index {
                        if let Some(tx) = self.pending_reads.remove(&token) {
                            let _ = tx.send(Ok(at_index));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Opens a `PeerLink` for a node added by a just-applied `ConfChange`,
    /// and tears one down for a removed node — the membership the engine
    /// tracks and the transport connections the worker holds must move
    /// together, or a newly added peer never receives anything.
    fn reconcile_transport(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            let EntryKind::ConfChange(op) = &entry.kind else {
                continue;
            };
            match op {
                ConfChangeOp::AddNode(id, endpoint) => {
                    if *id == self.engine.node_id || self.peers.contains_key(id) {
                        continue;
                    }
                    let ip: std::net::IpAddr = match endpoint.host.parse() {
                        Ok(ip) => ip,
                        Err(e) => {
                            tracing::warn!(peer = id, error = %e, "invalid peer endpoint, not connecting");
                            continue;
                        }
                    };
                    let addr = std::net::SocketAddr::new(ip, endpoint.port);
                    let (outbound_tx, outbound_rx) = mpsc::channel(self.peer_queue_capacity);
                    let preamble = HandshakePreamble {
                        cluster_name: self.cluster_name.clone(),
                        node_id: self.engine.node_id,
                        term_hint: self.engine.current_term,
                    };
                    tokio::spawn(tcp::run_peer_sender(
                        *id,
                        addr,
                        self.tcp_config.clone(),
                        preamble,
                        outbound_rx,
                    ));
                    self.peers.insert(
                        *id,
                        PeerLink {
                            outbound_tx,
                            next_message_id: 0,
                        },
                    );
                    tracing::info!(node_id = self.engine.node_id, peer = id, %endpoint, "opened transport to added peer");
                }
                ConfChangeOp::RemoveNode(id) => {
                    if self.peers.remove(id).is_some() {
                        tracing::info!(node_id = self.engine.node_id, peer = id, "tore down transport to removed peer");
                    }
                }
            }
        }
    }

    /// The engine builds `InstallSnapshot` requests with an empty
    /// `state_blob` — it has no access to storage or the state machine.
    /// The worker is the only place both are reachable, so it patches the
    /// real bytes in here, just before the message goes out.
    fn fill_snapshot_blob(&self, message: Message) -> Message {
        match message {
            Message::InstallSnapshot(mut req) => {
                let snapshot = self
                    .state_machine
                    .snapshot(req.configuration.clone(), req.included_term);
                req.state_blob = snapshot.state_blob;
                Message::InstallSnapshot(req)
            }
            other => other,
        }
    }

    fn send_to_peer(&mut self, to: NodeId, message: Message) {
        if let Some(link) = self.peers.get_mut(&to) {
            let message_id = link.next_message_id;
            link.next_message_id = link.next_message_id.wrapping_add(1);
            if link
                .outbound_tx
                .try_send(Outbound { message_id, message })
                .is_err()
            {
                tracing::warn!(peer = to, "outbound queue full or closed, dropping message");
            }
        }
    }

    fn publish_state(&self) {
        self.published.store(Arc::new(PublishedState {
            node_id: self.engine.node_id,
            role: self.engine.role,
            current_term: self.engine.current_term,
            commit_index: self.engine.commit_index,
            last_applied: self.engine.last_applied,
            leader_id: self.engine.leader_id,
            configuration: self.engine.configuration.clone(),
            worker_state: self.worker_state,
        }));
    }
}

async fn accept_loop(config: TcpConfig, cluster_name: ClusterName, inbound_tx: mpsc::Sender<(NodeId, Message)>) {
    let listener = match tcp::bind(&config).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind transport listener");
            return;
        }
    };
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let cluster_name = cluster_name.clone();
        let inbound_tx = inbound_tx.clone();
        let read_timeout = config.read_timeout;
        tokio::spawn(async move {
            let preamble = match tcp::recv_handshake(&mut stream, read_timeout, &cluster_name).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "handshake failed");
                    return;
                }
            };
            loop {
                match tcp::recv_frame(&mut stream, read_timeout, preamble.node_id).await {
                    Ok((_, message)) => {
                        if inbound_tx.send((preamble.node_id, message)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }
}
