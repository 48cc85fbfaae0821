//! Async driver around [`RaftCore`].
//!
//! # Purpose
//! Runs one consensus node: a driver task owns the core, persists state,
//! ships messages and dispatches committed entries; an apply worker feeds
//! those entries to the [`StateMachine`] strictly in order and takes periodic
//! snapshots; the transport accepts peer connections.
//!
//! # Notes
//! - A proposal resolves after the entry is committed *and* applied on this
//!   node, or fails with `NotLeader` if leadership is lost first.
//! - On shutdown, proposals that were not yet committed fail with `Shutdown`;
//!   entries already handed to the apply worker finish applying.
use crate::error::{BoxError, ConsensusError, Result};
use crate::message::Envelope;
use crate::protocol::{RaftCore, Snapshot};
use crate::state_machine::{MemorySnapshotSink, StateMachine};
use crate::storage::FileLogStore;
use crate::tls::TlsContext;
use crate::transport::Transport;
use crate::types::{EntryPayload, LogEntry, LogIndex, NodeId, RaftStats, Role, Term};
use crate::RaftConfig;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const COMMAND_QUEUE_DEPTH: usize = 1024;
const INBOUND_QUEUE_DEPTH: usize = 4096;

type Reply = oneshot::Sender<Result<LogIndex>>;

enum Command {
    Propose { data: Vec<u8>, reply: Reply },
    AddPeer { id: NodeId, addr: String, reply: Reply },
    RemovePeer { id: NodeId, reply: Reply },
    Compacted { index: LogIndex, data: Vec<u8> },
    Shutdown,
}

enum ApplyTask {
    Entry { entry: LogEntry, reply: Option<Reply> },
    Restore { snapshot: Snapshot },
}

/// Handle to a running consensus node.
pub struct RaftNode {
    id: NodeId,
    commands: mpsc::Sender<Command>,
    stats: watch::Receiver<RaftStats>,
    leader: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    apply_timeout: Duration,
}

impl RaftNode {
    /// Bind `config.raft_addr` and start the node.
    pub async fn start(config: RaftConfig, state_machine: Arc<dyn StateMachine>) -> Result<Self> {
        let listener = TcpListener::bind(&config.raft_addr).await?;
        Self::start_with_listener(config, state_machine, listener).await
    }

    /// Start the node on an already bound listener.
    pub async fn start_with_listener(
        config: RaftConfig,
        state_machine: Arc<dyn StateMachine>,
        listener: TcpListener,
    ) -> Result<Self> {
        let tls = config.tls.as_ref().map(TlsContext::load).transpose()?;
        let store = FileLogStore::open(&config.data_dir)?;
        let core_config = config.core_config();
        let seed = rand::random::<u64>();

        // Step 1: load persisted state or bootstrap a fresh node.
        let (mut core, snapshot_data) = match store.load()? {
            Some((state, data)) => {
                tracing::info!(node = %config.node_id, term = state.hard_state.term, "restoring persisted raft state");
                let core = RaftCore::restore(
                    config.node_id.clone(),
                    core_config,
                    seed,
                    state,
                    data.clone(),
                );
                (core, data)
            }
            None => {
                let mut core = RaftCore::new(config.node_id.clone(), core_config, seed);
                if config.should_bootstrap() {
                    tracing::info!(node = %config.node_id, peers = config.peers.len(), "bootstrapping cluster");
                    core.bootstrap(config.initial_membership());
                } else {
                    tracing::info!(node = %config.node_id, "waiting to be contacted by the bootstrap node");
                }
                (core, None)
            }
        };

        // Step 2: bring the state machine back to the snapshot before any
        // committed entry is replayed on top of it.
        if let Some(data) = snapshot_data {
            let sm = state_machine.clone();
            tokio::task::spawn_blocking(move || sm.restore(&data))
                .await
                .map_err(|err| ConsensusError::Apply(Box::new(err)))?
                .map_err(ConsensusError::Apply)?;
        }
        if core.take_dirty() {
            store.save_state(&core.persistent_state())?;
        }
        let membership = core.membership();
        if membership.voters.len() == 1 && membership.contains(&config.node_id) {
            core.campaign();
        }

        // Step 3: wire channels and spawn the tasks.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let snapshot_index = core.snapshot_index();
        let (applied_tx, applied_rx) = watch::channel(snapshot_index);
        let (leader_tx, leader_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(stats_of(&core, snapshot_index));

        let transport = Transport::new(tls, shutdown_rx);
        let mut addresses = config.peers.clone();
        addresses.extend(core.membership().voters.clone());

        let worker = tokio::spawn(apply_worker(
            state_machine,
            apply_rx,
            command_tx.downgrade(),
            applied_tx,
            config.snapshot_threshold,
            snapshot_index,
        ));
        let server = {
            let transport = transport.clone();
            let node_id = config.node_id.clone();
            tokio::spawn(async move { transport.serve(listener, node_id, inbound_tx).await })
        };
        let driver = Driver {
            core,
            store,
            transport,
            self_addr: config.raft_addr.clone(),
            addresses,
            pending: BTreeMap::new(),
            dispatched: snapshot_index,
            apply_tx,
            applied_rx,
            stats_tx,
            leader_tx,
            last_role: Role::Follower,
        };
        let tick = Duration::from_millis(config.tick_interval_ms.max(1));
        let driver = tokio::spawn(driver.run(command_rx, inbound_rx, tick));

        Ok(Self {
            id: config.node_id,
            commands: command_tx,
            stats: stats_rx,
            leader: leader_rx,
            shutdown: shutdown_tx,
            tasks: Mutex::new(vec![driver, worker, server]),
            apply_timeout: config.apply_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replicate `command` and wait until it is applied locally, bounded by the
    /// configured apply timeout.
    pub async fn apply(&self, command: Vec<u8>) -> Result<LogIndex> {
        self.apply_with_timeout(command, self.apply_timeout).await
    }

    pub async fn apply_with_timeout(&self, command: Vec<u8>, timeout: Duration) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Propose { data: command, reply }, rx, timeout)
            .await
    }

    pub async fn add_peer(&self, id: impl Into<NodeId>, addr: impl Into<String>) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        let command = Command::AddPeer {
            id: id.into(),
            addr: addr.into(),
            reply,
        };
        self.request(command, rx, self.apply_timeout).await
    }

    pub async fn remove_peer(&self, id: impl Into<NodeId>) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        let command = Command::RemovePeer {
            id: id.into(),
            reply,
        };
        self.request(command, rx, self.apply_timeout).await
    }

    async fn request(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<LogIndex>>,
        timeout: Duration,
    ) -> Result<LogIndex> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConsensusError::Shutdown)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ConsensusError::Timeout),
            Ok(Err(_)) => Err(ConsensusError::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.stats.borrow().leader_id.clone()
    }

    pub fn stats(&self) -> RaftStats {
        self.stats.borrow().clone()
    }

    /// Leadership transitions: `true` when this node becomes leader, `false`
    /// when it loses leadership.
    pub fn leader_changes(&self) -> watch::Receiver<bool> {
        self.leader.clone()
    }

    /// Wait until some node is known to lead the cluster.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let mut stats = self.stats.clone();
        let wait = async {
            loop {
                if let Some(leader) = stats.borrow_and_update().leader_id.clone() {
                    return Ok(leader);
                }
                if stats.changed().await.is_err() {
                    return Err(ConsensusError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConsensusError::ClusterUnavailable)?
    }

    /// Stop the node. Entries already committed finish applying before the
    /// returned future resolves.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "raft task ended abnormally");
            }
        }
    }
}

struct Driver {
    core: RaftCore,
    store: FileLogStore,
    transport: Transport,
    self_addr: String,
    addresses: BTreeMap<NodeId, String>,
    pending: BTreeMap<LogIndex, (Term, Reply)>,
    dispatched: LogIndex,
    apply_tx: mpsc::UnboundedSender<ApplyTask>,
    applied_rx: watch::Receiver<LogIndex>,
    stats_tx: watch::Sender<RaftStats>,
    leader_tx: watch::Sender<bool>,
    last_role: Role,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<Envelope>,
        tick: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if let Err(err) = self.flush() {
            tracing::error!(error = %err, "failed to persist raft state, stopping node");
            return;
        }
        loop {
            tokio::select! {
                _ = ticker.tick() => self.core.tick(),
                Some(envelope) = inbound.recv() => {
                    if !envelope.from_addr.is_empty() {
                        self.addresses.insert(envelope.from.clone(), envelope.from_addr);
                    }
                    self.core.step(&envelope.from, envelope.message);
                }
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        if let Err(err) = self.handle(command) {
                            tracing::error!(error = %err, "failed to persist raft state, stopping node");
                            break;
                        }
                    }
                },
            }
            if let Err(err) = self.flush() {
                tracing::error!(error = %err, "failed to persist raft state, stopping node");
                break;
            }
        }
        for (_, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(ConsensusError::Shutdown));
        }
        self.leader_tx.send_replace(false);
        tracing::info!(node = %self.core.id(), "raft driver stopped");
    }

    fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Propose { data, reply } => match self.core.propose(data) {
                Ok((term, index)) => {
                    self.pending.insert(index, (term, reply));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::AddPeer { id, addr, reply } => {
                let mut membership = self.core.membership().clone();
                if membership.voters.get(&id) == Some(&addr) {
                    let _ = reply.send(self.core.ensure_leader().map(|_| self.core.commit_index()));
                    return Ok(());
                }
                membership.voters.insert(id.clone(), addr.clone());
                self.addresses.insert(id, addr);
                self.propose_membership(membership, reply);
            }
            Command::RemovePeer { id, reply } => {
                let mut membership = self.core.membership().clone();
                if membership.voters.remove(&id).is_none() {
                    let _ = reply.send(self.core.ensure_leader().map(|_| self.core.commit_index()));
                    return Ok(());
                }
                self.propose_membership(membership, reply);
            }
            Command::Compacted { index, data } => {
                self.core.compact(index, data);
                if let Some(snapshot) = self.core.snapshot()
                    && snapshot.meta.last_index == index
                {
                    let meta = snapshot.meta.clone();
                    self.store.save_snapshot(&meta, &snapshot.data)?;
                    self.store.save_state(&self.core.persistent_state())?;
                    self.core.take_dirty();
                    self.store.prune_snapshots(&meta)?;
                    tracing::info!(node = %self.core.id(), index, "compacted raft log");
                }
            }
            Command::Shutdown => {}
        }
        Ok(())
    }

    fn propose_membership(&mut self, membership: crate::types::Membership, reply: Reply) {
        match self.core.propose_membership(membership) {
            Ok((term, index)) => {
                self.pending.insert(index, (term, reply));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Persist, then dispatch committed entries, then send messages.
    fn flush(&mut self) -> Result<()> {
        if let Some(snapshot) = self.core.take_received_snapshot() {
            self.store.save_snapshot(&snapshot.meta, &snapshot.data)?;
            self.store.save_state(&self.core.persistent_state())?;
            self.core.take_dirty();
            self.store.prune_snapshots(&snapshot.meta)?;
            self.dispatched = self.dispatched.max(snapshot.meta.last_index);
            let _ = self.apply_tx.send(ApplyTask::Restore { snapshot });
        }
        if self.core.take_dirty() {
            self.store.save_state(&self.core.persistent_state())?;
        }
        self.dispatch_committed();
        for out in self.core.take_messages() {
            let Some(addr) = self
                .core
                .membership()
                .voters
                .get(&out.to)
                .or_else(|| self.addresses.get(&out.to))
                .cloned()
            else {
                tracing::debug!(to = %out.to, "no address for raft peer");
                continue;
            };
            let envelope = Envelope {
                from: self.core.id().to_string(),
                from_addr: self.self_addr.clone(),
                to: out.to,
                message: out.message,
            };
            self.transport.send(&addr, envelope);
        }
        self.publish();
        Ok(())
    }

    fn dispatch_committed(&mut self) {
        let commit = self.core.commit_index();
        if commit <= self.dispatched {
            return;
        }
        for entry in self.core.entries_between(self.dispatched, commit) {
            let reply = match self.pending.remove(&entry.index) {
                Some((term, reply)) if term == entry.term => Some(reply),
                Some((_, reply)) => {
                    let _ = reply.send(Err(ConsensusError::NotLeader {
                        leader: self.core.leader_id().cloned(),
                    }));
                    None
                }
                None => None,
            };
            let _ = self.apply_tx.send(ApplyTask::Entry { entry, reply });
        }
        self.dispatched = commit;
        metrics::gauge!("raft_commit_index").set(commit as f64);
    }

    fn publish(&mut self) {
        let role = self.core.role();
        if role != self.last_role {
            if self.last_role == Role::Leader {
                let leader = self.core.leader_id().cloned();
                for (_, (_, reply)) in std::mem::take(&mut self.pending) {
                    let _ = reply.send(Err(ConsensusError::NotLeader {
                        leader: leader.clone(),
                    }));
                }
            }
            self.leader_tx.send_replace(role == Role::Leader);
            self.last_role = role;
        }
        let applied = *self.applied_rx.borrow();
        let stats = stats_of(&self.core, applied);
        self.stats_tx.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }
}

fn stats_of(core: &RaftCore, applied_index: LogIndex) -> RaftStats {
    let membership = core.membership();
    RaftStats {
        node_id: core.id().to_string(),
        role: core.role(),
        term: core.term(),
        leader_id: core.leader_id().cloned(),
        commit_index: core.commit_index(),
        applied_index,
        last_log_index: core.last_index(),
        peer_count: membership
            .voters
            .keys()
            .filter(|id| id.as_str() != core.id())
            .count(),
    }
}

async fn apply_worker(
    state_machine: Arc<dyn StateMachine>,
    mut tasks: mpsc::UnboundedReceiver<ApplyTask>,
    commands: mpsc::WeakSender<Command>,
    applied: watch::Sender<LogIndex>,
    snapshot_threshold: u64,
    mut last_snapshot: LogIndex,
) {
    while let Some(task) = tasks.recv().await {
        match task {
            ApplyTask::Entry { entry, reply } => {
                let index = entry.index;
                let result = match &entry.payload {
                    EntryPayload::Command { data } => state_machine
                        .apply(index, data)
                        .await
                        .map(|_| index)
                        .map_err(ConsensusError::Apply),
                    EntryPayload::Blank | EntryPayload::Membership { .. } => Ok(index),
                };
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            tracing::error!(index, error = %err, "failed to apply committed entry");
                        }
                    }
                }
                applied.send_replace(index);

                if snapshot_threshold > 0 && index.saturating_sub(last_snapshot) >= snapshot_threshold {
                    match take_snapshot(state_machine.clone()).await {
                        Ok(data) => {
                            last_snapshot = index;
                            if let Some(commands) = commands.upgrade() {
                                let _ = commands.send(Command::Compacted { index, data }).await;
                            }
                        }
                        Err(err) => tracing::warn!(index, error = %err, "snapshot failed"),
                    }
                }
            }
            ApplyTask::Restore { snapshot } => {
                let index = snapshot.meta.last_index;
                let sm = state_machine.clone();
                let data = snapshot.data.clone();
                match tokio::task::spawn_blocking(move || sm.restore(&data)).await {
                    Ok(Ok(())) => tracing::info!(index, "restored state machine from snapshot"),
                    Ok(Err(err)) => tracing::error!(index, error = %err, "snapshot restore failed"),
                    Err(err) => tracing::error!(index, error = %err, "snapshot restore panicked"),
                }
                last_snapshot = index;
                applied.send_replace(index);
            }
        }
    }
}

async fn take_snapshot(state_machine: Arc<dyn StateMachine>) -> std::result::Result<Vec<u8>, BoxError> {
    tokio::task::spawn_blocking(move || {
        let mut sink = MemorySnapshotSink::new();
        state_machine.persist(&mut sink)?;
        sink.into_bytes()
            .ok_or_else(|| BoxError::from("snapshot sink was cancelled"))
    })
    .await?
}
