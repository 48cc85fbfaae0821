//! Postgres implementation of the data-plane repositories.
//!
//! # Purpose
//! Users, identities, refresh tokens, sessions, consents, MFA factors, roles,
//! email tokens and users-table introspection over one `sqlx::PgPool`. The
//! pool is either the deployment-wide one opened by the adapter registry or a
//! tenant pool handed out by the tenancy layer ([`PostgresDataPlane::from_pool`]).
//!
//! # Key invariants
//! - Every row carries `tenant_id`; queries filter on it even when the pool
//!   already points at a tenant-private database.
//! - Tokens, sessions and email tokens are stored by hash only.
//! - Multi-statement contracts (user + password identity, identity upsert,
//!   refresh-token rotation, consent revocation, email-token consumption,
//!   field sync) each run in one transaction.
//!
//! # Security notes
//! - DSNs carry credentials; they are never logged.
//! - Dynamic SQL is limited to sanitized column identifiers
//!   ([`schema::sanitize_identifier`]) and fixed fragments built in code.
//!
//! # Notes
//! Rows are read into `Db*` structs and converted into model types, so the
//! model stays free of `sqlx` derives.
use super::{
    AdapterConfig, Connection, ConsentRepository, EmailTokenRepository, IdentityRepository,
    MfaRepository, RbacRepository, RefreshTokenRepository, SchemaRepository, SessionRepository,
    StoreError, StoreResult, UserRepository,
};
use crate::tenancy::{PgPoolFactory, PoolSettings};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

mod consents;
mod email_tokens;
mod identities;
mod mfa;
mod rbac;
pub mod schema;
mod sessions;
mod tokens;
mod users;

/// Advisory-lock owner used when migrating the deployment-wide database.
const SHARED_MIGRATION_OWNER: &str = "global";

/// The data-plane repositories over one pool.
#[derive(Debug, Clone)]
pub struct PostgresDataPlane {
    pool: PgPool,
}

impl PostgresDataPlane {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Registry connection for the `postgres` adapter.
pub struct PostgresConnection {
    data: Arc<PostgresDataPlane>,
}

impl PostgresConnection {
    /// Open the pool described by `config` and apply pending migrations under
    /// the shared advisory lock.
    pub async fn connect(config: &AdapterConfig) -> StoreResult<Self> {
        let dsn = config
            .dsn
            .as_deref()
            .filter(|dsn| !dsn.is_empty())
            .ok_or_else(|| StoreError::NoDatabase("postgres adapter requires a DSN".into()))?;
        let factory = PgPoolFactory::new(PoolSettings::from(config));
        let pool = factory.connect(dsn, config.schema.as_deref()).await?;
        if let Err(err) = factory.migrate_locked(SHARED_MIGRATION_OWNER, &pool).await {
            pool.close().await;
            return Err(err.context("migrate data-plane database"));
        }
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            data: Arc::new(PostgresDataPlane::from_pool(pool)),
        }
    }

    pub fn data_plane(&self) -> Arc<PostgresDataPlane> {
        self.data.clone()
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn backend_name(&self) -> &'static str {
        "postgres"
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
        sqlx::query("SELECT 1").execute(&self.data.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.data.pool.close().await;
    }
}

/// `NotFound` when an UPDATE or DELETE touched nothing.
fn expect_rows(affected: u64, what: impl FnOnce() -> String) -> StoreResult<()> {
    if affected == 0 {
        return Err(StoreError::NotFound(what()));
    }
    Ok(())
}

/// Empty strings are stored for absent optional text columns.
fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_without_dsn_is_no_database() {
        let err = PostgresConnection::connect(&AdapterConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_no_database());
    }

    #[test]
    fn helpers() {
        assert!(expect_rows(0, || "user u1".into()).unwrap_err().is_not_found());
        assert!(expect_rows(1, || unreachable!()).is_ok());
        assert_eq!(non_empty(String::new()), None);
        assert_eq!(non_empty("x".into()).as_deref(), Some("x"));
    }
}
