//! Cluster handles used by the service layer to submit mutations.
//!
//! [`RaftCluster`] replicates through the consensus node; [`LocalCluster`]
//! is the single-node variant that feeds the same applier directly, so both
//! deployments share one write path.
use super::applier::{ApplyError, Applier};
use super::mutation::{Mutation, MutationError};
use async_trait::async_trait;
use idplane_consensus::{ConsensusError, LogIndex, NodeId, RaftNode, RaftStats, Role};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

impl ClusterError {
    /// The leader hint when this node refused the write as a follower.
    pub fn not_leader(&self) -> Option<Option<&str>> {
        match self {
            ClusterError::Consensus(ConsensusError::NotLeader { leader }) => {
                Some(leader.as_deref())
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Replicate `mutation` and return once it is applied on this node.
    async fn apply(&self, mutation: &Mutation) -> Result<LogIndex, ClusterError>;

    async fn add_peer(&self, id: &str, addr: &str) -> Result<(), ClusterError>;

    async fn remove_peer(&self, id: &str) -> Result<(), ClusterError>;

    fn is_leader(&self) -> bool;

    fn leader_id(&self) -> Option<NodeId>;

    fn stats(&self) -> RaftStats;

    /// False for the single-node variant.
    fn is_clustered(&self) -> bool;

    async fn shutdown(&self);
}

pub struct RaftCluster {
    node: RaftNode,
}

impl RaftCluster {
    pub fn new(node: RaftNode) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }
}

#[async_trait]
impl Cluster for RaftCluster {
    async fn apply(&self, mutation: &Mutation) -> Result<LogIndex, ClusterError> {
        let bytes = mutation.encode()?;
        let started = Instant::now();
        let result = self.node.apply(bytes).await;
        metrics::histogram!("controlplane_apply_latency_seconds")
            .record(started.elapsed().as_secs_f64());
        match result {
            Ok(index) => {
                tracing::debug!(mutation = mutation.kind.as_str(), tenant = %mutation.tenant_slug, index, "mutation committed");
                Ok(index)
            }
            Err(err) => {
                tracing::warn!(mutation = mutation.kind.as_str(), tenant = %mutation.tenant_slug, error = %err, "mutation not committed");
                Err(err.into())
            }
        }
    }

    async fn add_peer(&self, id: &str, addr: &str) -> Result<(), ClusterError> {
        self.node.add_peer(id, addr).await?;
        tracing::info!(peer = id, addr, "peer added");
        Ok(())
    }

    async fn remove_peer(&self, id: &str) -> Result<(), ClusterError> {
        self.node.remove_peer(id).await?;
        tracing::info!(peer = id, "peer removed");
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.node.leader_id()
    }

    fn stats(&self) -> RaftStats {
        self.node.stats()
    }

    fn is_clustered(&self) -> bool {
        true
    }

    async fn shutdown(&self) {
        self.node.shutdown().await;
    }
}

/// Single-node handle: always leader, applies in submission order with a
/// local index.
pub struct LocalCluster {
    node_id: NodeId,
    applier: Arc<Applier>,
    index: AtomicU64,
    apply_lock: tokio::sync::Mutex<()>,
}

impl LocalCluster {
    pub fn new(node_id: impl Into<NodeId>, applier: Arc<Applier>) -> Self {
        Self {
            node_id: node_id.into(),
            applier,
            index: AtomicU64::new(0),
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn apply(&self, mutation: &Mutation) -> Result<LogIndex, ClusterError> {
        let _serial = self.apply_lock.lock().await;
        let index = self.index.load(Ordering::SeqCst) + 1;
        let started = Instant::now();
        self.applier.apply(index, mutation).await?;
        metrics::histogram!("controlplane_apply_latency_seconds")
            .record(started.elapsed().as_secs_f64());
        self.index.store(index, Ordering::SeqCst);
        Ok(index)
    }

    async fn add_peer(&self, _id: &str, _addr: &str) -> Result<(), ClusterError> {
        Err(ConsensusError::InvalidMembership("clustering is disabled".into()).into())
    }

    async fn remove_peer(&self, _id: &str) -> Result<(), ClusterError> {
        Err(ConsensusError::InvalidMembership("clustering is disabled".into()).into())
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_id(&self) -> Option<NodeId> {
        Some(self.node_id.clone())
    }

    fn stats(&self) -> RaftStats {
        let index = self.index.load(Ordering::SeqCst);
        RaftStats {
            node_id: self.node_id.clone(),
            role: Role::Leader,
            term: 0,
            leader_id: Some(self.node_id.clone()),
            commit_index: index,
            applied_index: index,
            last_log_index: index,
            peer_count: 0,
        }
    }

    fn is_clustered(&self) -> bool {
        false
    }

    async fn shutdown(&self) {}
}
