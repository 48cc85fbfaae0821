//! Repository contracts.
//!
//! # Purpose
//! One narrow trait per entity. The service layer, the replicated applier and
//! the background jobs depend only on these traits; the filesystem adapter
//! implements the control-plane side, the SQL adapter the data-plane side,
//! and the no-op adapter answers every data-plane call with `NoDatabase`.
//!
//! # Notes
//! Control-plane repositories are addressed by tenant slug. Data-plane
//! repositories take the tenant id, which every data-plane row carries.
use super::StoreResult;
use crate::model::{
    Admin, AdminRefreshToken, ClaimsConfig, Consent, EmailToken, Identity, IdentityLink,
    IdentityUpsert, MfaFactor, OidcClient, RefreshToken, Role, Scope, Session, SessionFilter,
    SessionView, Tenant, TokenStats, User, UserFieldDef,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<Tenant>>;
    async fn get_by_slug(&self, slug: &str) -> StoreResult<Tenant>;
    async fn get_by_id(&self, id: &str) -> StoreResult<Tenant>;
    /// Writes `tenant.yaml` and seeds the scope and claims files.
    async fn create(&self, tenant: &Tenant) -> StoreResult<()>;
    async fn update(&self, tenant: &Tenant) -> StoreResult<()>;
    /// Removes the tenant's whole directory.
    async fn delete(&self, slug: &str) -> StoreResult<()>;
    async fn exists(&self, slug: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn list(&self, tenant: &str) -> StoreResult<Vec<OidcClient>>;
    async fn get(&self, tenant: &str, client_id: &str) -> StoreResult<OidcClient>;
    async fn create(&self, tenant: &str, client: &OidcClient) -> StoreResult<()>;
    async fn update(&self, tenant: &str, client: &OidcClient) -> StoreResult<()>;
    async fn delete(&self, tenant: &str, client_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait ScopeRepository: Send + Sync {
    async fn list(&self, tenant: &str) -> StoreResult<Vec<Scope>>;
    async fn get(&self, tenant: &str, name: &str) -> StoreResult<Scope>;
    /// Insert or replace by name.
    async fn upsert(&self, tenant: &str, scope: &Scope) -> StoreResult<()>;
    async fn delete(&self, tenant: &str, name: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait ClaimsRepository: Send + Sync {
    async fn get(&self, tenant: &str) -> StoreResult<ClaimsConfig>;
    async fn put(&self, tenant: &str, claims: &ClaimsConfig) -> StoreResult<()>;
}

#[async_trait]
pub trait AdminRepository: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<Admin>>;
    async fn get(&self, id: &str) -> StoreResult<Admin>;
    async fn get_by_email(&self, email: &str) -> StoreResult<Admin>;
    async fn create(&self, admin: &Admin) -> StoreResult<()>;
    async fn update(&self, admin: &Admin) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait AdminTokenRepository: Send + Sync {
    async fn create(&self, token: &AdminRefreshToken) -> StoreResult<()>;
    async fn get_by_hash(&self, token_hash: &str) -> StoreResult<AdminRefreshToken>;
    async fn revoke(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    /// Drops expired and revoked tokens; returns how many were removed.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Inserts the user and its initial password identity in one transaction.
    async fn create(&self, user: &User, password_identity: &Identity) -> StoreResult<()>;
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<User>;
    async fn get_by_email(&self, tenant_id: &str, email: &str) -> StoreResult<User>;
    async fn list(&self, tenant_id: &str, limit: i64, offset: i64) -> StoreResult<Vec<User>>;
    async fn update(&self, user: &User) -> StoreResult<()>;
    async fn delete(&self, tenant_id: &str, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait IdentityRepository: Send + Sync {
    /// Update the identity if known, else link it to a user with the same
    /// email, else create both.
    async fn upsert(&self, input: &IdentityUpsert) -> StoreResult<IdentityLink>;
    async fn list_by_user(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<Identity>>;
    /// Refuses with `LastIdentity` when the user would be left without one.
    async fn unlink(&self, tenant_id: &str, user_id: &str, identity_id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn create(&self, token: &RefreshToken) -> StoreResult<()>;
    async fn get_by_hash(&self, token_hash: &str) -> StoreResult<RefreshToken>;
    /// Revokes `old_id` and stores `next` linked to it, atomically. Fails with
    /// `TokenExpired` if `old_id` is no longer active.
    async fn rotate(&self, old_id: &str, next: &RefreshToken) -> StoreResult<()>;
    async fn revoke(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    async fn revoke_all_by_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        client_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<u64>;
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
    async fn stats(&self, tenant_id: &str, now: DateTime<Utc>) -> StoreResult<TokenStats>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> StoreResult<()>;
    /// `Ok(None)` when absent.
    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Session>>;
    async fn get_by_hash(&self, session_id_hash: &str) -> StoreResult<Option<Session>>;
    async fn list(
        &self,
        filter: &SessionFilter,
        now: DateTime<Utc>,
        idle_after: Duration,
    ) -> StoreResult<Vec<SessionView>>;
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    async fn revoke(
        &self,
        id: &str,
        by: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait ConsentRepository: Send + Sync {
    /// Union with any previous grant and clear revocation.
    async fn upsert(&self, consent: &Consent) -> StoreResult<Consent>;
    async fn get(&self, tenant_id: &str, user_id: &str, client_id: &str)
    -> StoreResult<Option<Consent>>;
    async fn list_by_user(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<Consent>>;
    /// Revokes the consent and the matching refresh tokens.
    async fn revoke(
        &self,
        tenant_id: &str,
        user_id: &str,
        client_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn scope_in_use(&self, tenant_id: &str, scope: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait MfaRepository: Send + Sync {
    async fn list(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<MfaFactor>>;
    async fn upsert(&self, factor: &MfaFactor) -> StoreResult<()>;
    async fn confirm(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait RbacRepository: Send + Sync {
    async fn create_role(&self, role: &Role) -> StoreResult<()>;
    async fn list_roles(&self, tenant_id: &str) -> StoreResult<Vec<Role>>;
    async fn delete_role(&self, tenant_id: &str, role_id: &str) -> StoreResult<()>;
    async fn assign(&self, tenant_id: &str, user_id: &str, role_id: &str) -> StoreResult<()>;
    async fn unassign(&self, tenant_id: &str, user_id: &str, role_id: &str) -> StoreResult<()>;
    async fn roles_for_user(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<Role>>;
}

#[async_trait]
pub trait EmailTokenRepository: Send + Sync {
    async fn create(&self, token: &EmailToken) -> StoreResult<()>;
    /// Marks the token used; `TokenExpired` if expired or already used.
    async fn consume(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<EmailToken>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// A column of the users table as seen by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub unique: bool,
    pub indexed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSyncReport {
    pub added: Vec<String>,
    pub dropped: Vec<String>,
    pub altered: Vec<String>,
}

#[async_trait]
pub trait SchemaRepository: Send + Sync {
    async fn user_columns(&self) -> StoreResult<Vec<ColumnInfo>>;
    async fn sync_user_fields(&self, fields: &[UserFieldDef]) -> StoreResult<FieldSyncReport>;
}
