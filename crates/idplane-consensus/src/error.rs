use crate::types::NodeId;
use idplane_storage::StorageError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// This node is a follower; `leader` is the last leader it heard from.
    #[error("not the leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<NodeId> },
    /// An election is in progress and no quorum has been reached.
    #[error("cluster unavailable: no leader elected")]
    ClusterUnavailable,
    #[error("timed out waiting for commit")]
    Timeout,
    #[error("consensus node is shutting down")]
    Shutdown,
    /// A membership change is still uncommitted.
    #[error("membership change already in progress")]
    ChangeInProgress,
    #[error("invalid membership change: {0}")]
    InvalidMembership(String),
    /// The state machine refused a committed entry.
    #[error("apply failed: {0}")]
    Apply(#[source] BoxError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("tls configuration error: {0}")]
    Tls(String),
}

impl From<serde_json::Error> for ConsensusError {
    fn from(err: serde_json::Error) -> Self {
        ConsensusError::Codec(err.to_string())
    }
}

impl ConsensusError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ConsensusError::NotLeader { .. })
    }
}
