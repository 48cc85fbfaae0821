//! Service-level error taxonomy.
//!
//! # Purpose
//! Translates repository kinds, cluster failures, key-store and crypto errors
//! into domain errors handlers can map to a response without inspecting
//! backend types.
//!
//! # Key invariants
//! - `NotFound` on a tenant lookup surfaces as [`ServiceError::TenantNotFound`].
//! - Follower writes surface as [`ServiceError::NotLeader`] with the leader
//!   hint when one is known.
use crate::cluster::{ApplyError, ClusterError, MutationError};
use crate::keys::KeyError;
use crate::store::{StoreError, StoreErrorKind};
use idplane_consensus::ConsensusError;
use idplane_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("tenant {0} not found")]
    TenantNotFound(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("scope {0} is still referenced")]
    ScopeInUse(String),
    #[error("scope {0} is a system scope")]
    SystemScope(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("not the leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },
    #[error("cluster unavailable")]
    ClusterUnavailable,
    #[error("no database: {0}")]
    NoDatabase(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("token expired: {0}")]
    TokenExpired(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("secret handling failed")]
    Crypto(#[from] CryptoError),
    #[error("signing keys: {0}")]
    Keys(KeyError),
    #[error(transparent)]
    Store(StoreError),
    #[error("replication failed: {0}")]
    Cluster(ClusterError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ServiceError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Map a repository error from a lookup of `slug`.
    pub fn tenant_lookup(slug: &str, err: StoreError) -> Self {
        if err.is_not_found() {
            ServiceError::TenantNotFound(slug.to_string())
        } else {
            err.into()
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::TenantNotFound(_) | ServiceError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ServiceError::Conflict(_) | ServiceError::ScopeInUse(_) | ServiceError::SystemScope(_)
        )
    }

    /// Stable machine-readable code for responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::TenantNotFound(_) | ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::ScopeInUse(_) => "scope_in_use",
            ServiceError::SystemScope(_) => "system_scope",
            ServiceError::Invalid { .. } => "invalid_input",
            ServiceError::NotLeader { .. } => "not_leader",
            ServiceError::ClusterUnavailable => "cluster_unavailable",
            ServiceError::NoDatabase(_) => "no_database",
            ServiceError::Unauthorized(_) => "unauthorized",
            ServiceError::TokenExpired(_) => "token_expired",
            ServiceError::Unsupported(_) => "unsupported",
            ServiceError::Crypto(_) | ServiceError::Keys(_) => "internal",
            ServiceError::Store(err) => err.kind().as_str(),
            ServiceError::Cluster(_) => "internal",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err.kind() {
            StoreErrorKind::NotFound => ServiceError::NotFound(err.to_string()),
            StoreErrorKind::Conflict => ServiceError::Conflict(err.to_string()),
            StoreErrorKind::NoDatabase => ServiceError::NoDatabase(err.to_string()),
            StoreErrorKind::Unauthorized => ServiceError::Unauthorized(err.to_string()),
            StoreErrorKind::TokenExpired => ServiceError::TokenExpired(err.to_string()),
            StoreErrorKind::NotImplemented => ServiceError::Unsupported(err.to_string()),
            _ => ServiceError::Store(err),
        }
    }
}

impl From<KeyError> for ServiceError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::NotFound(what) => ServiceError::NotFound(what),
            KeyError::InvalidOwner(owner) => {
                ServiceError::invalid("owner", format!("{owner:?} is not a key owner"))
            }
            err @ KeyError::InvalidGrace(_) => ServiceError::invalid("grace", err.to_string()),
            other => ServiceError::Keys(other),
        }
    }
}

impl From<MutationError> for ServiceError {
    fn from(err: MutationError) -> Self {
        ClusterError::from(err).into()
    }
}

impl From<ClusterError> for ServiceError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Consensus(ConsensusError::NotLeader { leader }) => {
                ServiceError::NotLeader { leader }
            }
            ClusterError::Consensus(ConsensusError::ClusterUnavailable)
            | ClusterError::Consensus(ConsensusError::Timeout) => ServiceError::ClusterUnavailable,
            ClusterError::Apply(ApplyError::Store { source, .. }) => source.into(),
            ClusterError::Apply(ApplyError::Keys { source, .. }) => source.into(),
            other => ServiceError::Cluster(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MutationType;

    #[test]
    fn store_kinds_map_to_domain_errors() {
        assert!(ServiceError::from(StoreError::NotFound("x".into())).is_not_found());
        assert!(ServiceError::from(StoreError::Conflict("x".into())).is_conflict());
        assert_eq!(
            ServiceError::from(StoreError::NoDatabase("x".into())).code(),
            "no_database"
        );
        assert_eq!(
            ServiceError::from(StoreError::LockTimeout("x".into())).code(),
            "lock_timeout"
        );
        assert!(matches!(
            ServiceError::tenant_lookup("acme", StoreError::NotFound("tenant acme".into())),
            ServiceError::TenantNotFound(slug) if slug == "acme"
        ));
    }

    #[test]
    fn cluster_errors_keep_the_leader_hint() {
        let err: ServiceError = ClusterError::from(ConsensusError::NotLeader {
            leader: Some("n1".into()),
        })
        .into();
        assert!(matches!(err, ServiceError::NotLeader { leader: Some(ref l) } if l == "n1"));
        assert_eq!(err.to_string(), "not the leader (leader: n1)");

        let timeout: ServiceError = ClusterError::from(ConsensusError::Timeout).into();
        assert_eq!(timeout.code(), "cluster_unavailable");

        let applied: ServiceError = ClusterError::from(ApplyError::Store {
            kind: MutationType::ClientCreate,
            tenant: "acme".into(),
            source: StoreError::Conflict("client web".into()),
        })
        .into();
        assert!(applied.is_conflict());
    }

    #[test]
    fn key_errors_keep_their_meaning() {
        assert!(ServiceError::from(KeyError::NotFound("kid k1".into())).is_not_found());
        assert_eq!(ServiceError::from(KeyError::MissingMasterKey).code(), "internal");
        assert_eq!(ServiceError::from(KeyError::InvalidGrace(u64::MAX)).code(), "invalid_input");
    }
}
