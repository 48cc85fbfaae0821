use super::{SingleFlight, resolve_cache};
use crate::model::CacheSettings;
use crate::store::{StoreError, StoreResult, TenantRepository};
use dashmap::DashMap;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const MEMORY_DRIVER: &str = "memory";
pub const REDIS_DRIVER: &str = "redis";

fn redis_error(err: redis::RedisError) -> StoreError {
    StoreError::Unexpected(anyhow::Error::new(err).context("redis"))
}

/// In-process cache with per-entry expiry, used when a tenant configures the
/// `memory` driver or no cache at all.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Option<Instant>)>,
}

impl MemoryCache {
    pub fn get(&self, key: &str) -> Option<String> {
        let expired = {
            let entry = self.entries.get(key)?;
            match entry.1 {
                Some(deadline) if Instant::now() >= deadline => true,
                _ => return Some(entry.0.clone()),
            }
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), (value.to_string(), deadline));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone)]
pub enum CacheBackend {
    Memory(Arc<MemoryCache>),
    Redis(ConnectionManager),
}

/// A tenant's cache client. Keys are namespaced with the tenant's configured
/// prefix.
#[derive(Clone)]
pub struct TenantCache {
    prefix: String,
    backend: CacheBackend,
}

impl TenantCache {
    pub fn memory(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            backend: CacheBackend::Memory(Arc::new(MemoryCache::default())),
        }
    }

    pub async fn redis(settings: &CacheSettings, password: &str) -> StoreResult<Self> {
        let auth = if password.is_empty() {
            String::new()
        } else {
            format!(":{password}@")
        };
        let port = if settings.port == 0 { 6379 } else { settings.port };
        let url = format!("redis://{auth}{}:{port}/{}", settings.host, settings.db);
        let client = redis::Client::open(url.as_str()).map_err(redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_error)?;
        Ok(Self {
            prefix: settings.prefix.clone(),
            backend: CacheBackend::Redis(conn),
        })
    }

    pub fn driver(&self) -> &'static str {
        match self.backend {
            CacheBackend::Memory(_) => MEMORY_DRIVER,
            CacheBackend::Redis(_) => REDIS_DRIVER,
        }
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.key(key);
        match &self.backend {
            CacheBackend::Memory(cache) => Ok(cache.get(&key)),
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                let value: Option<String> = redis::cmd("GET")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                Ok(value)
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let key = self.key(key);
        match &self.backend {
            CacheBackend::Memory(cache) => {
                cache.set(&key, value, ttl);
                Ok(())
            }
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key).arg(value);
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
                }
                let _: () = cmd.query_async(&mut conn).await.map_err(redis_error)?;
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = self.key(key);
        match &self.backend {
            CacheBackend::Memory(cache) => Ok(cache.delete(&key)),
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                let removed: u64 = redis::cmd("DEL")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                Ok(removed > 0)
            }
        }
    }

    pub async fn ping(&self) -> StoreResult<()> {
        match &self.backend {
            CacheBackend::Memory(_) => Ok(()),
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                let _: String = redis::cmd("PING")
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                Ok(())
            }
        }
    }
}

/// Lazily created per-tenant cache clients, deduplicated like the pool
/// manager.
pub struct CacheManager {
    tenants: Arc<dyn TenantRepository>,
    clients: RwLock<HashMap<String, TenantCache>>,
    flight: SingleFlight<String, TenantCache>,
    closed: AtomicBool,
}

impl CacheManager {
    pub fn new(tenants: Arc<dyn TenantRepository>) -> Self {
        Self {
            tenants,
            clients: RwLock::new(HashMap::new()),
            flight: SingleFlight::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn cached(&self, tenant: &str) -> Option<TenantCache> {
        self.clients.read().get(tenant).cloned()
    }

    /// Fails with `Closed` after [`CacheManager::close`].
    pub async fn get(&self, tenant: &str) -> StoreResult<TenantCache> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed("tenant cache manager".into()));
        }
        if let Some(cache) = self.cached(tenant) {
            return Ok(cache);
        }
        self.flight
            .run(tenant.to_string(), || self.create(tenant))
            .await
    }

    async fn create(&self, tenant: &str) -> StoreResult<TenantCache> {
        if let Some(cache) = self.cached(tenant) {
            return Ok(cache);
        }
        let record = self.tenants.get_by_slug(tenant).await?;
        let resolved = resolve_cache(&record)?;
        let cache = match resolved.driver.as_str() {
            MEMORY_DRIVER => TenantCache::memory(resolved.settings.prefix.clone()),
            REDIS_DRIVER => TenantCache::redis(&resolved.settings, &resolved.password)
                .await
                .map_err(|err| err.context(format!("cache for tenant {tenant}")))?,
            other => {
                return Err(StoreError::NotImplemented(format!(
                    "cache driver {other:?} for tenant {tenant}"
                )));
            }
        };
        self.clients.write().insert(tenant.to_string(), cache.clone());
        metrics::counter!("tenant_cache_created_total", "driver" => cache.driver()).increment(1);
        tracing::info!(tenant, driver = cache.driver(), "tenant cache ready");
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn evict(&self, tenant: &str) {
        self.clients.write().remove(tenant);
    }

    /// Drop every client. Redis connection managers close when their last
    /// clone is dropped. Safe to call twice.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clients.write().clear();
    }
}
