//! Replicated control-plane writes.
//!
//! # Purpose
//! Control-plane writes travel as [`Mutation`]s through a [`Cluster`]
//! handle. Every node applies committed mutations with the deterministic
//! [`Applier`]; [`ControlPlaneFsm`] adds snapshot and restore of the
//! replicated trees on top.
//!
//! # Key invariants
//! - The leader fixes ids, timestamps, ciphertexts and key material before
//!   submitting; nothing on the apply path may produce new values.
//! - Within the log, mutations apply in order on every node. Followers may
//!   lag the leader; no cross-node linearizable reads are offered.
//!
//! # Notes
//! `admins/` is not replicated; admin accounts are node-local.
use crate::store::fs::FsStore;
use idplane_consensus::{ConsensusError, RaftConfig, RaftNode};
use std::sync::Arc;

mod applier;
mod fsm;
mod handle;
pub mod mutation;

pub use applier::{ApplyError, Applier};
pub use fsm::{ControlPlaneFsm, SNAPSHOT_SUBTREES};
pub use handle::{Cluster, ClusterError, LocalCluster, RaftCluster};
pub use mutation::{Mutation, MutationError, MutationType};

/// Start a consensus node whose state machine is the control-plane store,
/// and log leadership transitions in the background.
pub async fn start_raft(
    config: RaftConfig,
    applier: Applier,
    store: Arc<FsStore>,
) -> Result<RaftCluster, ConsensusError> {
    let node_id = config.node_id.clone();
    let fsm = Arc::new(ControlPlaneFsm::new(applier, store));
    let node = RaftNode::start(config, fsm).await?;

    let mut leader = node.leader_changes();
    tokio::spawn(async move {
        while leader.changed().await.is_ok() {
            let is_leader = *leader.borrow_and_update();
            tracing::info!(node = %node_id, is_leader, "raft leadership changed");
        }
    });
    Ok(RaftCluster::new(node))
}

/// The single-node handle used when clustering is disabled.
pub fn local(node_id: &str, applier: Applier) -> LocalCluster {
    LocalCluster::new(node_id, Arc::new(applier))
}
