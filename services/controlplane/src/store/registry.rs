use super::fs::FsConnection;
use super::noop::NoopConnection;
use super::postgres::PostgresConnection;
use super::{Connection, StoreError, StoreResult};
use futures::future::BoxFuture;
use idplane_crypto::SigningMasterKey;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything an adapter factory may need. Each adapter reads the fields it
/// understands and ignores the rest.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub dsn: Option<String>,
    pub schema: Option<String>,
    pub fs_root: PathBuf,
    pub max_open: u32,
    pub max_idle: u32,
    pub conn_max_lifetime: Duration,
    pub signing_master_key: Option<SigningMasterKey>,
    pub migrations_dir: PathBuf,
    pub lock_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            schema: None,
            fs_root: PathBuf::from("data"),
            max_open: 10,
            max_idle: 2,
            conn_max_lifetime: Duration::from_secs(1800),
            signing_master_key: None,
            migrations_dir: PathBuf::from("migrations/tenant"),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

pub type AdapterFactory =
    Arc<dyn Fn(AdapterConfig) -> BoxFuture<'static, StoreResult<Arc<dyn Connection>>> + Send + Sync>;

/// Maps adapter names to factories.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `fs`, `postgres` and `noop` adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "fs",
            Arc::new(|config: AdapterConfig| {
                Box::pin(async move {
                    let conn: Arc<dyn Connection> = Arc::new(FsConnection::open(&config)?);
                    Ok(conn)
                })
            }),
        );
        registry.register(
            "postgres",
            Arc::new(|config: AdapterConfig| {
                Box::pin(async move {
                    let conn: Arc<dyn Connection> =
                        Arc::new(PostgresConnection::connect(&config).await?);
                    Ok(conn)
                })
            }),
        );
        registry.register(
            "noop",
            Arc::new(|_config: AdapterConfig| {
                Box::pin(async move {
                    let conn: Arc<dyn Connection> = Arc::new(NoopConnection::new());
                    Ok(conn)
                })
            }),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub async fn open(&self, name: &str, config: AdapterConfig) -> StoreResult<Arc<dyn Connection>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| StoreError::NotImplemented(format!("unknown adapter {name:?}")))?;
        factory(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_registered() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["fs", "noop", "postgres"]);
    }

    #[tokio::test]
    async fn unknown_adapter_is_not_implemented() {
        let registry = AdapterRegistry::with_defaults();
        let err = registry
            .open("mysql", AdapterConfig::default())
            .await
            .err()
            .expect("unknown adapter");
        assert_eq!(err.kind(), crate::store::StoreErrorKind::NotImplemented);
    }

    #[tokio::test]
    async fn fs_and_noop_open() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AdapterRegistry::with_defaults();
        let config = AdapterConfig {
            fs_root: dir.path().to_path_buf(),
            ..AdapterConfig::default()
        };
        let fs = registry.open("fs", config.clone()).await.unwrap();
        assert_eq!(fs.backend_name(), "fs");
        assert!(fs.tenants().is_some());
        assert!(fs.users().is_none());

        let noop = registry.open("noop", config).await.unwrap();
        assert!(noop.tenants().is_none());
        let users = noop.users().expect("noop exposes data-plane repositories");
        let err = users.get("t1", "u1").await.unwrap_err();
        assert!(err.is_no_database());
        noop.close().await;
        noop.close().await;
    }
}
