//! YAML-on-disk control-plane store.
//!
//! # Purpose
//! Implements the tenant, client, scope, claims, admin and admin-token
//! repositories over a directory tree:
//!
//! ```text
//! <root>/tenants/<slug>/{tenant.yaml, clients.yaml, scopes.yaml, claims.yaml}
//! <root>/admins/{admins.yaml, refresh_tokens.yaml}
//! <root>/keys/...            (owned by the signing-key store)
//! ```
//!
//! # Key invariants
//! - Every write holds the store's write lock and goes through `atomic_write`.
//! - Output is a pure function of the stored values, so two nodes applying
//!   the same mutations end with byte-identical trees.
//! - Plaintext secrets are cleared before writing; tenant setting secrets are
//!   decrypted on read when the process master key is loaded.
use super::{
    AdapterConfig, AdminRepository, AdminTokenRepository, ClaimsRepository, ClientRepository,
    Connection, ScopeRepository, StoreError, StoreResult, TenantRepository,
};
use crate::keys::KeyStore;
use crate::service::validation::valid_slug;
use async_trait::async_trait;
use idplane_storage::{DEFAULT_FILE_MODE, atomic_write, read_optional};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod admins;
mod clients;
mod scopes;
mod tenants;

pub const TENANTS_DIR: &str = "tenants";
pub const ADMINS_DIR: &str = "admins";
pub const KEYS_DIR: &str = "keys";

const TENANT_FILE: &str = "tenant.yaml";
const CLIENTS_FILE: &str = "clients.yaml";
const SCOPES_FILE: &str = "scopes.yaml";
const CLAIMS_FILE: &str = "claims.yaml";
const ADMINS_FILE: &str = "admins.yaml";
const ADMIN_TOKENS_FILE: &str = "refresh_tokens.yaml";

#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in [TENANTS_DIR, ADMINS_DIR, KEYS_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared guard for multi-file reads.
    pub fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Exclusive guard, also taken by snapshot restore while it swaps trees.
    pub fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    fn tenant_dir(&self, slug: &str) -> StoreResult<PathBuf> {
        if !valid_slug(slug) {
            return Err(StoreError::InvalidInput(format!("invalid tenant slug {slug:?}")));
        }
        Ok(self.root.join(TENANTS_DIR).join(slug))
    }

    /// Directory of an existing tenant, `NotFound` otherwise.
    fn existing_tenant_dir(&self, slug: &str) -> StoreResult<PathBuf> {
        let dir = self.tenant_dir(slug)?;
        if !dir.join(TENANT_FILE).is_file() {
            return Err(StoreError::NotFound(format!("tenant {slug}")));
        }
        Ok(dir)
    }

    fn admins_path(&self, file: &str) -> PathBuf {
        self.root.join(ADMINS_DIR).join(file)
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match read_optional(path)? {
        Some(raw) => Ok(Some(serde_yaml::from_slice(&raw).map_err(|err| {
            StoreError::Unexpected(anyhow::anyhow!("parse {}: {err}", path.display()))
        })?)),
        None => Ok(None),
    }
}

/// Missing list files read as empty.
fn read_list<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    Ok(read_yaml(path)?.unwrap_or_default())
}

fn write_yaml<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let encoded = serde_yaml::to_string(value)?;
    atomic_write(path, encoded.as_bytes(), DEFAULT_FILE_MODE)?;
    Ok(())
}

/// Filesystem adapter connection: the control-plane repositories plus the
/// signing-key store rooted at `<root>/keys`.
pub struct FsConnection {
    store: Arc<FsStore>,
    keys: KeyStore,
}

impl FsConnection {
    pub fn open(config: &AdapterConfig) -> StoreResult<Self> {
        let store = Arc::new(FsStore::open(&config.fs_root)?);
        let keys = KeyStore::with_lock(
            config.fs_root.join(KEYS_DIR),
            config.signing_master_key.clone(),
            store.lock.clone(),
        );
        Ok(Self { store, keys })
    }

    pub fn store(&self) -> Arc<FsStore> {
        self.store.clone()
    }
}

#[async_trait]
impl Connection for FsConnection {
    fn backend_name(&self) -> &'static str {
        "fs"
    }
    fn tenants(&self) -> Option<Arc<dyn TenantRepository>> {
        Some(self.store.clone())
    }
    fn clients(&self) -> Option<Arc<dyn ClientRepository>> {
        Some(self.store.clone())
    }
    fn scopes(&self) -> Option<Arc<dyn ScopeRepository>> {
        Some(self.store.clone())
    }
    fn claims(&self) -> Option<Arc<dyn ClaimsRepository>> {
        Some(self.store.clone())
    }
    fn admins(&self) -> Option<Arc<dyn AdminRepository>> {
        Some(self.store.clone())
    }
    fn admin_tokens(&self) -> Option<Arc<dyn AdminTokenRepository>> {
        Some(self.store.clone())
    }
    fn keys(&self) -> Option<KeyStore> {
        Some(self.keys.clone())
    }

    async fn ping(&self) -> StoreResult<()> {
        let _guard = self.store.read_guard();
        fs::read_dir(self.store.root.join(TENANTS_DIR))?;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::FsStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub const TEST_MASTER_KEY_B64: &str = "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA=";

    /// The same key for every test in the process; loading is idempotent.
    pub fn init_secretbox() {
        idplane_crypto::secretbox::load_master_key(TEST_MASTER_KEY_B64)
            .expect("load test master key");
    }

    pub fn temp_store() -> (TempDir, Arc<FsStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FsStore::open(dir.path()).expect("open store"));
        (dir, store)
    }
}
