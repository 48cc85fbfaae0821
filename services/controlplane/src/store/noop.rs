//! Data plane for deployments that run the control plane alone.
//!
//! Every data-plane call fails with `NoDatabase`; control-plane accessors
//! are absent.
use super::repository::{
    ColumnInfo, ConsentRepository, EmailTokenRepository, FieldSyncReport, IdentityRepository,
    MfaRepository, RbacRepository, RefreshTokenRepository, SchemaRepository, SessionRepository,
    UserRepository,
};
use super::{Connection, StoreError, StoreResult};
use crate::model::{
    Consent, EmailToken, Identity, IdentityLink, IdentityUpsert, MfaFactor, RefreshToken, Role,
    Session, SessionFilter, SessionView, TokenStats, User, UserFieldDef,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

fn no_db<T>() -> StoreResult<T> {
    Err(StoreError::NoDatabase(
        "data plane is not configured for this deployment".to_string(),
    ))
}

#[derive(Debug, Default)]
pub struct NoopDataPlane;

#[derive(Debug, Clone)]
pub struct NoopConnection {
    data: Arc<NoopDataPlane>,
}

impl NoopConnection {
    pub fn new() -> Self {
        Self {
            data: Arc::new(NoopDataPlane),
        }
    }
}

impl Default for NoopConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for NoopConnection {
    fn backend_name(&self) -> &'static str {
        "noop"
    }
    fn users(&self) -> Option<Arc<dyn UserRepository>> {
        Some(self.data.clone())
    }
    fn identities(&self) -> Option<Arc<dyn IdentityRepository>> {
        Some(self.data.clone())
    }
    fn refresh_tokens(&self) -> Option<Arc<dyn RefreshTokenRepository>> {
        Some(self.data.clone())
    }
    fn sessions(&self) -> Option<Arc<dyn SessionRepository>> {
        Some(self.data.clone())
    }
    fn consents(&self) -> Option<Arc<dyn ConsentRepository>> {
        Some(self.data.clone())
    }
    fn mfa(&self) -> Option<Arc<dyn MfaRepository>> {
        Some(self.data.clone())
    }
    fn rbac(&self) -> Option<Arc<dyn RbacRepository>> {
        Some(self.data.clone())
    }
    fn email_tokens(&self) -> Option<Arc<dyn EmailTokenRepository>> {
        Some(self.data.clone())
    }
    fn schema(&self) -> Option<Arc<dyn SchemaRepository>> {
        Some(self.data.clone())
    }

    async fn ping(&self) -> StoreResult<()> {
        no_db()
    }

    async fn close(&self) {}
}

#[async_trait]
impl UserRepository for NoopDataPlane {
    async fn create(&self, _user: &User, _identity: &Identity) -> StoreResult<()> {
        no_db()
    }
    async fn get(&self, _tenant_id: &str, _id: &str) -> StoreResult<User> {
        no_db()
    }
    async fn get_by_email(&self, _tenant_id: &str, _email: &str) -> StoreResult<User> {
        no_db()
    }
    async fn list(&self, _tenant_id: &str, _limit: i64, _offset: i64) -> StoreResult<Vec<User>> {
        no_db()
    }
    async fn update(&self, _user: &User) -> StoreResult<()> {
        no_db()
    }
    async fn delete(&self, _tenant_id: &str, _id: &str) -> StoreResult<()> {
        no_db()
    }
}

#[async_trait]
impl IdentityRepository for NoopDataPlane {
    async fn upsert(&self, _input: &IdentityUpsert) -> StoreResult<IdentityLink> {
        no_db()
    }
    async fn list_by_user(&self, _tenant_id: &str, _user_id: &str) -> StoreResult<Vec<Identity>> {
        no_db()
    }
    async fn unlink(&self, _tenant_id: &str, _user_id: &str, _identity_id: &str) -> StoreResult<()> {
        no_db()
    }
}

#[async_trait]
impl RefreshTokenRepository for NoopDataPlane {
    async fn create(&self, _token: &RefreshToken) -> StoreResult<()> {
        no_db()
    }
    async fn get_by_hash(&self, _token_hash: &str) -> StoreResult<RefreshToken> {
        no_db()
    }
    async fn rotate(&self, _old_id: &str, _next: &RefreshToken) -> StoreResult<()> {
        no_db()
    }
    async fn revoke(&self, _id: &str, _at: DateTime<Utc>) -> StoreResult<()> {
        no_db()
    }
    async fn revoke_all_by_user(
        &self,
        _tenant_id: &str,
        _user_id: &str,
        _client_id: Option<&str>,
        _at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        no_db()
    }
    async fn cleanup_expired(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        no_db()
    }
    async fn stats(&self, _tenant_id: &str, _now: DateTime<Utc>) -> StoreResult<TokenStats> {
        no_db()
    }
}

#[async_trait]
impl SessionRepository for NoopDataPlane {
    async fn create(&self, _session: &Session) -> StoreResult<()> {
        no_db()
    }
    async fn get(&self, _tenant_id: &str, _id: &str) -> StoreResult<Option<Session>> {
        no_db()
    }
    async fn get_by_hash(&self, _hash: &str) -> StoreResult<Option<Session>> {
        no_db()
    }
    async fn list(
        &self,
        _filter: &SessionFilter,
        _now: DateTime<Utc>,
        _idle_after: Duration,
    ) -> StoreResult<Vec<SessionView>> {
        no_db()
    }
    async fn touch(&self, _id: &str, _at: DateTime<Utc>) -> StoreResult<()> {
        no_db()
    }
    async fn revoke(
        &self,
        _id: &str,
        _by: Option<&str>,
        _reason: Option<&str>,
        _at: DateTime<Utc>,
    ) -> StoreResult<()> {
        no_db()
    }
    async fn delete_expired(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        no_db()
    }
}

#[async_trait]
impl ConsentRepository for NoopDataPlane {
    async fn upsert(&self, _consent: &Consent) -> StoreResult<Consent> {
        no_db()
    }
    async fn get(
        &self,
        _tenant_id: &str,
        _user_id: &str,
        _client_id: &str,
    ) -> StoreResult<Option<Consent>> {
        no_db()
    }
    async fn list_by_user(&self, _tenant_id: &str, _user_id: &str) -> StoreResult<Vec<Consent>> {
        no_db()
    }
    async fn revoke(
        &self,
        _tenant_id: &str,
        _user_id: &str,
        _client_id: &str,
        _at: DateTime<Utc>,
    ) -> StoreResult<()> {
        no_db()
    }
    async fn scope_in_use(&self, _tenant_id: &str, _scope: &str) -> StoreResult<bool> {
        no_db()
    }
}

#[async_trait]
impl MfaRepository for NoopDataPlane {
    async fn list(&self, _tenant_id: &str, _user_id: &str) -> StoreResult<Vec<MfaFactor>> {
        no_db()
    }
    async fn upsert(&self, _factor: &MfaFactor) -> StoreResult<()> {
        no_db()
    }
    async fn confirm(&self, _id: &str, _at: DateTime<Utc>) -> StoreResult<()> {
        no_db()
    }
    async fn delete(&self, _id: &str) -> StoreResult<()> {
        no_db()
    }
}

#[async_trait]
impl RbacRepository for NoopDataPlane {
    async fn create_role(&self, _role: &Role) -> StoreResult<()> {
        no_db()
    }
    async fn list_roles(&self, _tenant_id: &str) -> StoreResult<Vec<Role>> {
        no_db()
    }
    async fn delete_role(&self, _tenant_id: &str, _role_id: &str) -> StoreResult<()> {
        no_db()
    }
    async fn assign(&self, _tenant_id: &str, _user_id: &str, _role_id: &str) -> StoreResult<()> {
        no_db()
    }
    async fn unassign(&self, _tenant_id: &str, _user_id: &str, _role_id: &str) -> StoreResult<()> {
        no_db()
    }
    async fn roles_for_user(&self, _tenant_id: &str, _user_id: &str) -> StoreResult<Vec<Role>> {
        no_db()
    }
}

#[async_trait]
impl EmailTokenRepository for NoopDataPlane {
    async fn create(&self, _token: &EmailToken) -> StoreResult<()> {
        no_db()
    }
    async fn consume(&self, _token_hash: &str, _now: DateTime<Utc>) -> StoreResult<EmailToken> {
        no_db()
    }
    async fn delete_expired(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
        no_db()
    }
}

#[async_trait]
impl SchemaRepository for NoopDataPlane {
    async fn user_columns(&self) -> StoreResult<Vec<ColumnInfo>> {
        no_db()
    }
    async fn sync_user_fields(&self, _fields: &[UserFieldDef]) -> StoreResult<FieldSyncReport> {
        no_db()
    }
}
