//! Tenant-scoped resources.
//!
//! # Purpose
//! Creates each tenant's database pool and cache client on first use and
//! keeps them for the life of the process.
//!
//! # Key invariants
//! - Concurrent first requests for one tenant perform a single creation; every
//!   caller receives the same instance.
//! - A pool is cached only after its migrations succeeded; failures close it.
//! - Migrations for a tenant run under a Postgres advisory lock so several
//!   nodes may start at once.
//! - The map write lock is never held across the creation call.
//!
//! # Notes
//! Secrets are read from the tenant record: the plaintext field when the
//! store revealed it, otherwise the `*Enc` field is opened with the process
//! secretbox.
use crate::model::{CacheSettings, Tenant};
use crate::store::{AdapterConfig, StoreError, StoreResult, TenantRepository};
use idplane_crypto::secretbox;
use std::sync::Arc;

mod cache;
mod lock;
mod migrate;
mod pool;
mod single_flight;

pub use cache::{CacheBackend, CacheManager, MEMORY_DRIVER, MemoryCache, REDIS_DRIVER, TenantCache};
pub use lock::{AdvisoryLock, lock_id};
pub use migrate::{MigrationReport, MigrationRunner, MigrationScript};
pub use pool::{PgPoolFactory, PoolFactory, PoolManager, PoolSettings};
pub use single_flight::SingleFlight;

/// Connection details for a tenant's user database.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedDb {
    pub dsn: String,
    pub schema: Option<String>,
    pub manual_mode: bool,
}

impl std::fmt::Debug for ResolvedDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDb")
            .field("dsn", &"<redacted>")
            .field("schema", &self.schema)
            .field("manual_mode", &self.manual_mode)
            .finish()
    }
}

fn open_secret(plain: &str, sealed: &str) -> StoreResult<String> {
    if !plain.is_empty() {
        return Ok(plain.to_string());
    }
    if sealed.is_empty() {
        return Ok(String::new());
    }
    Ok(secretbox::decrypt(sealed)?)
}

pub fn resolve_user_db(tenant: &Tenant) -> StoreResult<ResolvedDb> {
    let no_db = || StoreError::NoDatabase(format!("tenant {} has no user database", tenant.slug));
    let db = tenant.settings.user_db.as_ref().ok_or_else(no_db)?;
    if !db.driver.is_empty() && db.driver != "postgres" {
        return Err(StoreError::NotImplemented(format!(
            "user database driver {:?} for tenant {}",
            db.driver, tenant.slug
        )));
    }
    let dsn = open_secret(&db.dsn, &db.dsn_enc)?;
    if dsn.is_empty() {
        return Err(no_db());
    }
    Ok(ResolvedDb {
        dsn,
        schema: db.schema.clone().filter(|s| !s.is_empty()),
        manual_mode: db.manual_mode,
    })
}

/// Cache settings with the driver defaulted and the password opened.
pub struct ResolvedCache {
    pub driver: String,
    pub settings: CacheSettings,
    pub password: String,
}

/// Tenants without cache settings get the in-process memory driver.
pub fn resolve_cache(tenant: &Tenant) -> StoreResult<ResolvedCache> {
    let settings = tenant.settings.cache.clone().unwrap_or_default();
    let driver = if settings.driver.is_empty() {
        MEMORY_DRIVER.to_string()
    } else {
        settings.driver.to_ascii_lowercase()
    };
    let password = open_secret(&settings.password, &settings.password_enc)?;
    Ok(ResolvedCache {
        driver,
        settings,
        password,
    })
}

/// The pool and cache managers of one process.
pub struct TenantResources {
    pub pools: PoolManager<PgPoolFactory>,
    pub caches: CacheManager,
}

impl TenantResources {
    pub fn new(tenants: Arc<dyn TenantRepository>, config: &AdapterConfig) -> Self {
        Self {
            pools: PoolManager::new(tenants.clone(), PgPoolFactory::new(PoolSettings::from(config))),
            caches: CacheManager::new(tenants),
        }
    }

    /// Forget a tenant's pool and cache, e.g. after its settings changed or
    /// it was deleted.
    pub async fn evict(&self, tenant: &str) {
        self.pools.evict(tenant).await;
        self.caches.evict(tenant);
    }

    pub async fn close(&self) {
        self.pools.close().await;
        self.caches.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TenantSettings, UserDbSettings};
    use crate::store::StoreErrorKind;
    use crate::store::fs::test_support::init_secretbox;
    use chrono::Utc;

    fn tenant(settings: TenantSettings) -> Tenant {
        let now = Utc::now();
        Tenant {
            id: "id-acme".into(),
            slug: "acme".into(),
            name: "Acme".into(),
            language: "en".into(),
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn missing_user_db_is_no_database() {
        let err = resolve_user_db(&tenant(TenantSettings::default())).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NoDatabase);

        let settings = TenantSettings {
            user_db: Some(UserDbSettings::default()),
            ..TenantSettings::default()
        };
        let err = resolve_user_db(&tenant(settings)).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NoDatabase);
    }

    #[test]
    fn sealed_dsn_is_opened() {
        init_secretbox();
        let settings = TenantSettings {
            user_db: Some(UserDbSettings {
                driver: "postgres".into(),
                dsn_enc: secretbox::encrypt("postgres://u:p@db/acme").unwrap(),
                schema: Some("acme".into()),
                ..UserDbSettings::default()
            }),
            ..TenantSettings::default()
        };
        let db = resolve_user_db(&tenant(settings)).unwrap();
        assert_eq!(db.dsn, "postgres://u:p@db/acme");
        assert_eq!(db.schema.as_deref(), Some("acme"));
        assert!(!format!("{db:?}").contains("u:p"));
    }

    #[test]
    fn other_sql_drivers_are_not_implemented() {
        let settings = TenantSettings {
            user_db: Some(UserDbSettings {
                driver: "mysql".into(),
                dsn: "mysql://db".into(),
                ..UserDbSettings::default()
            }),
            ..TenantSettings::default()
        };
        let err = resolve_user_db(&tenant(settings)).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NotImplemented);
    }

    #[test]
    fn cache_defaults_to_memory() {
        let resolved = resolve_cache(&tenant(TenantSettings::default())).unwrap();
        assert_eq!(resolved.driver, MEMORY_DRIVER);
        assert!(resolved.password.is_empty());
    }
}
