//! Control-plane service.
//!
//! # Purpose
//! Thin orchestration over the repositories: validates and normalizes input,
//! seals secrets, fixes ids and timestamps, and submits replicated writes as
//! mutations through the [`Cluster`] handle. Reads go straight to the local
//! repositories.
//!
//! # Key invariants
//! - Nothing that reaches a mutation carries a plaintext secret.
//! - Every replicated write is built in full here, on the leader; the applier
//!   only copies values.
//! - Repository kinds are translated into [`ServiceError`] before returning.
//!
//! # Notes
//! Admin accounts, claims configuration and key revocation are node-local
//! writes; they bypass the log.
use crate::cluster::{Cluster, Mutation};
use crate::keys::JwksCache;
use crate::model::Tenant;
use crate::store::DataAccess;
use crate::tenancy::TenantResources;
use idplane_consensus::LogIndex;
use std::sync::Arc;

mod admins;
mod clients;
mod consent;
mod error;
mod keys;
mod scopes;
mod secrets;
mod tenants;
pub mod validation;

pub use admins::{CreateAdmin, IssuedAdminToken, PasswordVerifier, UpdateAdmin};
pub use error::{ServiceError, ServiceResult};
pub use secrets::{seal_client_secret, seal_settings};
pub use tenants::{CreateTenant, UpdateTenant};

/// Default grace window for a retiring signing key.
pub const DEFAULT_ROTATION_GRACE_SECS: u64 = 24 * 60 * 60;

#[derive(Clone)]
pub struct ControlPlaneService {
    dal: DataAccess,
    cluster: Arc<dyn Cluster>,
    jwks: Arc<JwksCache>,
    passwords: Option<Arc<dyn PasswordVerifier>>,
    resources: Option<Arc<TenantResources>>,
    rotation_grace_secs: u64,
}

impl ControlPlaneService {
    pub fn new(dal: DataAccess, cluster: Arc<dyn Cluster>, jwks: Arc<JwksCache>) -> Self {
        Self {
            dal,
            cluster,
            jwks,
            passwords: None,
            resources: None,
            rotation_grace_secs: DEFAULT_ROTATION_GRACE_SECS,
        }
    }

    pub fn with_password_verifier(mut self, verifier: Arc<dyn PasswordVerifier>) -> Self {
        self.passwords = Some(verifier);
        self
    }

    /// Evict cached pools and cache clients when a tenant changes.
    pub fn with_tenant_resources(mut self, resources: Arc<TenantResources>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_rotation_grace(mut self, grace_secs: u64) -> Self {
        self.rotation_grace_secs = grace_secs;
        self
    }

    pub fn dal(&self) -> &DataAccess {
        &self.dal
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn jwks_cache(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    async fn submit(&self, mutation: Mutation) -> ServiceResult<LogIndex> {
        let index = self.cluster.apply(&mutation).await?;
        tracing::info!(
            mutation = mutation.kind.as_str(),
            tenant = %mutation.tenant_slug,
            index,
            "mutation submitted"
        );
        Ok(index)
    }

    async fn require_tenant(&self, slug: &str) -> ServiceResult<Tenant> {
        self.dal
            .tenants()?
            .get_by_slug(slug)
            .await
            .map_err(|err| ServiceError::tenant_lookup(slug, err))
    }

    async fn evict_tenant(&self, slug: &str) {
        if let Some(resources) = &self.resources {
            resources.evict(slug).await;
        }
    }
}
