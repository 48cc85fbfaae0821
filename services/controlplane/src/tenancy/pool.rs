use super::{AdvisoryLock, MigrationReport, MigrationRunner, SingleFlight, resolve_user_db};
use crate::store::{AdapterConfig, StoreError, StoreResult, TenantRepository};
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Opens, migrates and closes tenant pools. The manager owns caching and
/// deduplication; factories only do the I/O.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    async fn open(&self, tenant: &str, dsn: &str, schema: Option<&str>) -> StoreResult<Self::Pool>;
    async fn migrate(&self, tenant: &str, pool: &Self::Pool) -> StoreResult<MigrationReport>;
    async fn close(&self, pool: &Self::Pool);
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    pub conn_max_lifetime: Duration,
    pub lock_timeout: Duration,
    pub migrations_dir: std::path::PathBuf,
}

impl From<&AdapterConfig> for PoolSettings {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            max_open: config.max_open,
            max_idle: config.max_idle,
            conn_max_lifetime: config.conn_max_lifetime,
            lock_timeout: config.lock_timeout,
            migrations_dir: config.migrations_dir.clone(),
        }
    }
}

/// sqlx Postgres pools with migrations under the tenant's advisory lock.
pub struct PgPoolFactory {
    settings: PoolSettings,
    runner: MigrationRunner,
}

impl PgPoolFactory {
    pub fn new(settings: PoolSettings) -> Self {
        let runner = MigrationRunner::new(settings.migrations_dir.clone());
        Self { settings, runner }
    }

    pub async fn connect(&self, dsn: &str, schema: Option<&str>) -> StoreResult<PgPool> {
        let mut options = PgConnectOptions::from_str(dsn)?;
        if let Some(schema) = schema.filter(|s| !s.is_empty()) {
            options = options.options([("search_path", schema)]);
        }
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_open.max(1))
            .min_connections(self.settings.max_idle.min(self.settings.max_open))
            .max_lifetime(self.settings.conn_max_lifetime)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    /// Run pending migrations while holding `tenant`'s advisory lock. The
    /// scripts run on the lock's own connection, so a one-connection pool is
    /// enough.
    pub async fn migrate_locked(&self, tenant: &str, pool: &PgPool) -> StoreResult<MigrationReport> {
        let mut lock = AdvisoryLock::acquire(pool, tenant, self.settings.lock_timeout).await?;
        let outcome = match lock.connection() {
            Ok(conn) => self.runner.run(conn).await,
            Err(err) => Err(err),
        };
        let released = lock.release().await;
        let report = outcome?;
        released?;
        tracing::info!(tenant, applied = report.applied, skipped = report.skipped, "tenant migrations finished");
        Ok(report)
    }
}

#[async_trait]
impl PoolFactory for PgPoolFactory {
    type Pool = PgPool;

    async fn open(&self, _tenant: &str, dsn: &str, schema: Option<&str>) -> StoreResult<PgPool> {
        self.connect(dsn, schema).await
    }

    async fn migrate(&self, tenant: &str, pool: &PgPool) -> StoreResult<MigrationReport> {
        self.migrate_locked(tenant, pool).await
    }

    async fn close(&self, pool: &PgPool) {
        pool.close().await;
    }
}

/// Lazily created per-tenant database pools.
pub struct PoolManager<F: PoolFactory> {
    tenants: Arc<dyn TenantRepository>,
    factory: F,
    pools: RwLock<HashMap<String, F::Pool>>,
    flight: SingleFlight<String, F::Pool>,
    closed: AtomicBool,
}

impl<F: PoolFactory> PoolManager<F> {
    pub fn new(tenants: Arc<dyn TenantRepository>, factory: F) -> Self {
        Self {
            tenants,
            factory,
            pools: RwLock::new(HashMap::new()),
            flight: SingleFlight::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn cached(&self, tenant: &str) -> Option<F::Pool> {
        self.pools.read().get(tenant).cloned()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed("tenant pool manager".into()));
        }
        Ok(())
    }

    /// The tenant's pool, created and migrated on first use. Concurrent
    /// first calls share a single creation. Fails with `Closed` after
    /// [`PoolManager::close`].
    pub async fn get(&self, tenant: &str) -> StoreResult<F::Pool> {
        self.ensure_open()?;
        if let Some(pool) = self.cached(tenant) {
            return Ok(pool);
        }
        self.flight
            .run(tenant.to_string(), || self.create(tenant))
            .await
    }

    async fn create(&self, tenant: &str) -> StoreResult<F::Pool> {
        if let Some(pool) = self.cached(tenant) {
            return Ok(pool);
        }
        // Step 1: resolve the DSN; tenants without one have no database.
        let record = self.tenants.get_by_slug(tenant).await?;
        let db = resolve_user_db(&record)?;

        // Step 2: open and migrate; a failed migration closes the pool.
        let pool = self.factory.open(tenant, &db.dsn, db.schema.as_deref()).await?;
        if db.manual_mode {
            tracing::debug!(tenant, "manual migration mode; skipping tenant migrations");
        } else if let Err(err) = self.factory.migrate(tenant, &pool).await {
            self.factory.close(&pool).await;
            return Err(err.context(format!("migrate tenant {tenant}")));
        }

        // Step 3: publish, unless the manager closed meanwhile.
        if self.closed.load(Ordering::SeqCst) {
            self.factory.close(&pool).await;
            return Err(StoreError::Closed("tenant pool manager".into()));
        }
        self.pools.write().insert(tenant.to_string(), pool.clone());
        metrics::counter!("tenant_pool_created_total").increment(1);
        tracing::info!(tenant, "tenant database pool ready");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Drop and close one tenant's pool, e.g. after its DSN changed.
    pub async fn evict(&self, tenant: &str) {
        let removed = self.pools.write().remove(tenant);
        if let Some(pool) = removed {
            self.factory.close(&pool).await;
        }
    }

    /// Close every pool and empty the map. Safe to call twice.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            self.factory.close(&pool).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tenant, TenantSettings, UserDbSettings};
    use crate::store::fs::test_support::{init_secretbox, temp_store};
    use idplane_crypto::secretbox;
    use crate::store::StoreErrorKind;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        migrated: AtomicUsize,
        closed: AtomicUsize,
        fail_migrate: bool,
    }

    #[async_trait]
    impl PoolFactory for Arc<CountingFactory> {
        type Pool = Arc<String>;

        async fn open(&self, tenant: &str, dsn: &str, _schema: Option<&str>) -> StoreResult<Arc<String>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(format!("{tenant}@{dsn}")))
        }

        async fn migrate(&self, _tenant: &str, _pool: &Arc<String>) -> StoreResult<MigrationReport> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.migrated.fetch_add(1, Ordering::SeqCst);
            if self.fail_migrate {
                return Err(StoreError::Unexpected(anyhow::anyhow!("bad script")));
            }
            Ok(MigrationReport { applied: 1, skipped: 0 })
        }

        async fn close(&self, _pool: &Arc<String>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn tenants_with(slug: &str, dsn: Option<&str>) -> (tempfile::TempDir, Arc<dyn TenantRepository>) {
        init_secretbox();
        let (dir, store) = temp_store();
        let now = Utc::now();
        let mut settings = TenantSettings::default();
        if let Some(dsn) = dsn {
            settings.user_db = Some(UserDbSettings {
                driver: "postgres".into(),
                dsn_enc: secretbox::encrypt(dsn).unwrap(),
                ..UserDbSettings::default()
            });
        }
        let tenant = Tenant {
            id: format!("id-{slug}"),
            slug: slug.into(),
            name: slug.into(),
            language: "en".into(),
            settings,
            created_at: now,
            updated_at: now,
        };
        TenantRepository::create(store.as_ref(), &tenant).await.unwrap();
        let repo: Arc<dyn TenantRepository> = store;
        (dir, repo)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn first_access_creates_and_migrates_exactly_once() {
        let (_dir, tenants) = tenants_with("newtenant", Some("postgres://db/newtenant")).await;
        let factory = Arc::new(CountingFactory::default());
        let manager = Arc::new(PoolManager::new(tenants, factory.clone()));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get("newtenant").await }));
        }
        let mut pools = Vec::new();
        for handle in handles {
            pools.push(handle.await.unwrap());
        }
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(factory.migrated.load(Ordering::SeqCst), 1);
        let first = pools[0].as_ref().unwrap().clone();
        assert!(pools.iter().all(|p| Arc::ptr_eq(p.as_ref().unwrap(), &first)));
        assert_eq!(manager.len(), 1);

        manager.close().await;
        manager.close().await;
        assert!(manager.is_empty());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);

        let err = manager.get("newtenant").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Closed);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tenant_without_dsn_fails_fast() {
        let (_dir, tenants) = tenants_with("nodb", None).await;
        let factory = Arc::new(CountingFactory::default());
        let manager = PoolManager::new(tenants, factory.clone());
        let err = manager.get("nodb").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NoDatabase);
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_migration_closes_and_does_not_cache() {
        let (_dir, tenants) = tenants_with("broken", Some("postgres://db/broken")).await;
        let factory = Arc::new(CountingFactory {
            fail_migrate: true,
            ..CountingFactory::default()
        });
        let manager = PoolManager::new(tenants, factory.clone());
        assert!(manager.get("broken").await.is_err());
        assert!(manager.is_empty());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }
}
