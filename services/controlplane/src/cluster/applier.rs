//! Deterministic mutation applier.
//!
//! # Purpose
//! Turns a committed [`Mutation`] into repository calls or signing-key file
//! writes. Every node runs the same applier over the same log.
//!
//! # Key invariants
//! - No clock reads, id generation, randomness or encryption on this path;
//!   every value comes from the mutation.
//! - Create and update share a payload: the applier checks existence and
//!   picks the call, so replaying an entry is safe.
//! - Deletes of missing targets succeed.
//! - `key.rotate` blobs are written byte-for-byte.
use super::mutation::{
    ClientPayload, DeletePayload, Mutation, MutationError, MutationType, SettingsPayload,
    TenantPayload,
};
use crate::keys::{GLOBAL_OWNER, JwksCache, KeyError, KeyStore, RotationPayload};
use crate::model::{OidcClient, Scope};
use crate::store::{
    ClientRepository, DataAccess, ScopeRepository, StoreError, StoreResult, TenantRepository,
};
use idplane_consensus::LogIndex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("apply {kind} for {tenant}: {source}")]
    Store {
        kind: MutationType,
        tenant: String,
        #[source]
        source: StoreError,
    },
    #[error("apply key.rotate for {owner}: {source}")]
    Keys {
        owner: String,
        #[source]
        source: KeyError,
    },
}

#[derive(Clone)]
pub struct Applier {
    tenants: Arc<dyn TenantRepository>,
    clients: Arc<dyn ClientRepository>,
    scopes: Arc<dyn ScopeRepository>,
    keys: KeyStore,
    jwks: Arc<JwksCache>,
}

/// Missing targets count as already deleted.
fn idempotent_delete(result: StoreResult<()>) -> StoreResult<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

impl Applier {
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        clients: Arc<dyn ClientRepository>,
        scopes: Arc<dyn ScopeRepository>,
        keys: KeyStore,
        jwks: Arc<JwksCache>,
    ) -> Self {
        Self {
            tenants,
            clients,
            scopes,
            keys,
            jwks,
        }
    }

    pub fn from_dal(dal: &DataAccess, jwks: Arc<JwksCache>) -> StoreResult<Self> {
        Ok(Self::new(dal.tenants()?, dal.clients()?, dal.scopes()?, dal.keys()?, jwks))
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    pub async fn apply(&self, index: LogIndex, mutation: &Mutation) -> Result<(), ApplyError> {
        let kind = mutation.kind;
        let tenant = mutation.tenant_slug.as_str();
        let store_err = |source: StoreError| ApplyError::Store {
            kind,
            tenant: tenant.to_string(),
            source,
        };

        match kind {
            MutationType::TenantCreate | MutationType::TenantUpdate => {
                let payload: TenantPayload = mutation.payload_as()?;
                self.apply_tenant(mutation, payload).await.map_err(store_err)?;
            }
            MutationType::TenantDelete => {
                idempotent_delete(self.tenants.delete(tenant).await).map_err(store_err)?;
                self.keys.remove_owner(tenant).map_err(|source| ApplyError::Keys {
                    owner: tenant.to_string(),
                    source,
                })?;
                self.jwks.invalidate(tenant);
            }
            MutationType::SettingsUpdate => {
                let payload: SettingsPayload = mutation.payload_as()?;
                let mut current = self.tenants.get_by_slug(tenant).await.map_err(store_err)?;
                current.settings = payload.settings;
                current.updated_at = mutation.timestamp();
                self.tenants.update(&current).await.map_err(store_err)?;
            }
            MutationType::ClientCreate | MutationType::ClientUpdate => {
                let payload: ClientPayload = mutation.payload_as()?;
                self.apply_client(tenant, payload.into()).await.map_err(store_err)?;
            }
            MutationType::ClientDelete => {
                let payload: DeletePayload = mutation.payload_as()?;
                idempotent_delete(self.clients.delete(tenant, &payload.id).await)
                    .map_err(store_err)?;
            }
            MutationType::ScopeCreate => {
                let scope: Scope = mutation.payload_as()?;
                self.scopes.upsert(tenant, &scope).await.map_err(store_err)?;
            }
            MutationType::ScopeDelete => {
                let payload: DeletePayload = mutation.payload_as()?;
                idempotent_delete(self.scopes.delete(tenant, &payload.id).await)
                    .map_err(store_err)?;
            }
            MutationType::KeyRotate => {
                let payload: RotationPayload = mutation.payload_as()?;
                self.apply_rotation(tenant, &payload)?;
            }
        }

        metrics::counter!("controlplane_mutations_applied_total", "type" => kind.as_str())
            .increment(1);
        tracing::debug!(mutation = kind.as_str(), tenant, index, "mutation applied");
        Ok(())
    }

    async fn apply_tenant(&self, mutation: &Mutation, payload: TenantPayload) -> StoreResult<()> {
        let mut tenant = payload.into_tenant(mutation.timestamp());
        if tenant.slug.is_empty() {
            tenant.slug = mutation.tenant_slug.clone();
        }
        if tenant.slug != mutation.tenant_slug {
            return Err(StoreError::InvalidInput(format!(
                "payload slug {} does not match mutation tenant {}",
                tenant.slug, mutation.tenant_slug
            )));
        }
        if self.tenants.exists(&tenant.slug).await? {
            self.tenants.update(&tenant).await
        } else {
            self.tenants.create(&tenant).await
        }
    }

    async fn apply_client(&self, tenant: &str, client: OidcClient) -> StoreResult<()> {
        match self.clients.get(tenant, &client.client_id).await {
            Ok(_) => self.clients.update(tenant, &client).await,
            Err(err) if err.is_not_found() => self.clients.create(tenant, &client).await,
            Err(err) => Err(err),
        }
    }

    fn apply_rotation(&self, tenant: &str, payload: &RotationPayload) -> Result<(), ApplyError> {
        let owner = if tenant.is_empty() { GLOBAL_OWNER } else { tenant };
        self.keys
            .write_raw(owner, &payload.active_json, payload.retiring_json.as_deref())
            .map_err(|source| ApplyError::Keys {
                owner: owner.to_string(),
                source,
            })?;
        // Tenants without their own keys are served from the global owner.
        if owner == GLOBAL_OWNER {
            self.jwks.invalidate_all();
        } else {
            self.jwks.invalidate(owner);
        }
        Ok(())
    }
}
