//! Raft-style replicated log for control-plane mutations.
//!
//! # Purpose
//! Replicates opaque command bytes across a small static cluster and hands
//! committed entries, in log order, to a [`StateMachine`] on every node.
//!
//! # Layout
//! - [`protocol`]: the pure protocol state machine (roles, terms, votes, log
//!   matching, commit, membership, snapshot install). No I/O, no clocks.
//! - [`storage`]: `raft/raft.db` plus `raft/snapshots/`.
//! - [`transport`] / [`tls`]: length-prefixed frames over TCP or mutual TLS.
//! - [`node`]: the async driver that wires the pieces together.
//!
//! # Key invariants
//! - Hard state and log are persisted before any message is sent.
//! - Entries are applied strictly in index order, once per process lifetime.
//! - Only the leader accepts proposals; followers answer `NotLeader`.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

mod error;
pub mod message;
pub mod node;
pub mod protocol;
pub mod state_machine;
pub mod storage;
pub mod tls;
pub mod transport;
mod types;

pub use error::{BoxError, ConsensusError, Result};
pub use node::RaftNode;
pub use state_machine::{MemorySnapshotSink, SnapshotSink, StateMachine};
pub use tls::TlsSettings;
pub use types::{
    EntryPayload, HardState, LogEntry, LogIndex, Membership, NodeId, RaftStats, Role,
    SnapshotMeta, Term,
};

/// Consensus configuration for one node.
///
/// ```
/// use idplane_consensus::RaftConfig;
///
/// let config = RaftConfig::default();
/// assert!(config.election_timeout_ms > config.heartbeat_interval_ms);
/// assert!(config.peers.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    /// Address this node listens on and advertises to peers.
    pub raft_addr: String,
    /// Static peers (id -> address), excluding this node.
    pub peers: BTreeMap<NodeId, String>,
    /// Bootstrap the full configuration even if this node's id is not the
    /// smallest.
    pub bootstrap_preferred: bool,
    /// Directory holding `raft.db` and `snapshots/`.
    pub data_dir: PathBuf,
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub tick_interval_ms: u64,
    /// Applied entries between automatic snapshots.
    pub snapshot_threshold: u64,
    pub max_append_entries: usize,
    pub apply_timeout: Duration,
    pub tls: Option<TlsSettings>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".into(),
            raft_addr: "127.0.0.1:7000".into(),
            peers: BTreeMap::new(),
            bootstrap_preferred: false,
            data_dir: PathBuf::from("data/raft"),
            election_timeout_ms: 1500,
            heartbeat_interval_ms: 300,
            tick_interval_ms: 50,
            snapshot_threshold: 1024,
            max_append_entries: 64,
            apply_timeout: Duration::from_millis(5000),
            tls: None,
        }
    }
}

impl RaftConfig {
    /// The membership this node bootstraps with: itself plus every static peer.
    pub fn initial_membership(&self) -> Membership {
        let mut voters = self.peers.clone();
        voters.insert(self.node_id.clone(), self.raft_addr.clone());
        Membership { voters }
    }

    /// Whether a node without persisted state should bootstrap the cluster.
    ///
    /// A node alone always bootstraps. With peers, the preferred node or the
    /// node with the smallest id bootstraps; everyone else waits to be
    /// contacted.
    pub fn should_bootstrap(&self) -> bool {
        if self.peers.is_empty() || self.bootstrap_preferred {
            return true;
        }
        self.peers.keys().all(|peer| self.node_id < *peer)
    }

    pub(crate) fn core_config(&self) -> protocol::CoreConfig {
        let tick = self.tick_interval_ms.max(1);
        protocol::CoreConfig {
            election_ticks: (self.election_timeout_ms / tick).max(2),
            heartbeat_ticks: (self.heartbeat_interval_ms / tick).max(1),
            max_append_entries: self.max_append_entries.max(1),
        }
    }
}
