//! Signing-key store.
//!
//! # Purpose
//! Keeps one active and at most one retiring signing key per owner as JSON
//! files under `<root>/keys`:
//!
//! ```text
//! keys/active.json             global owner
//! keys/retiring.json
//! keys/<slug>/active.json      per-tenant owner
//! keys/<slug>/retiring.json
//! ```
//!
//! # Key invariants
//! - No unwrapped private key is ever written: every write path requires the
//!   signing master key and fails with `MissingMasterKey` without it.
//! - A tenant without its own `active.json` is served by the global owner,
//!   both for the active key and for the JWKS. This fallback is deliberate
//!   policy for deployments that start out with shared keys.
//! - Rotating such a tenant retires the global key into the tenant's own
//!   `retiring.json`, so tokens signed just before the rotation still verify
//!   against the tenant's JWKS.
//! - Grace windows are bounded by [`MAX_GRACE_SECONDS`] on every write path.
//! - In clustered mode only the leader generates material
//!   ([`KeyStore::prepare_rotation`]); every node stores the resulting bytes
//!   unchanged through [`KeyStore::write_raw`].
//!
//! # Notes
//! Writes share the filesystem store's lock when built through the `fs`
//! adapter, so snapshot restore excludes key writes while it swaps trees.
use chrono::{DateTime, Utc};
use idplane_crypto::{CryptoError, SigningMasterKey};
use idplane_storage::{DEFAULT_FILE_MODE, StorageError, atomic_write, read_optional};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

mod cache;
mod material;

pub use cache::JwksCache;
pub use material::{Jwk, Jwks, KeyStatus, MAX_GRACE_SECONDS, SigningAlgorithm, StoredKey};

/// Owner name of the deployment-wide keys stored at the root of `keys/`.
pub const GLOBAL_OWNER: &str = "global";

const ACTIVE_FILE: &str = "active.json";
const RETIRING_FILE: &str = "retiring.json";

pub type KeyResult<T> = Result<T, KeyError>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("signing master key not configured")]
    MissingMasterKey,
    #[error("no signing key: {0}")]
    NotFound(String),
    #[error("invalid key owner {0:?}")]
    InvalidOwner(String),
    #[error("grace window of {0}s exceeds {max}s", max = MAX_GRACE_SECONDS)]
    InvalidGrace(u64),
    #[error("key material: {0}")]
    Material(String),
    #[error("key crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("key storage: {0}")]
    Storage(#[from] StorageError),
    #[error("key io: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload of a `key.rotate` mutation: the exact file contents to store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPayload {
    pub active_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retiring_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
    master: Option<SigningMasterKey>,
    lock: Arc<RwLock<()>>,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>, master: Option<SigningMasterKey>) -> Self {
        Self::with_lock(root, master, Arc::new(RwLock::new(())))
    }

    pub fn with_lock(
        root: impl Into<PathBuf>,
        master: Option<SigningMasterKey>,
        lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            root: root.into(),
            master,
            lock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_master_key(&self) -> bool {
        self.master.is_some()
    }

    pub fn master_key(&self) -> KeyResult<&SigningMasterKey> {
        self.master.as_ref().ok_or(KeyError::MissingMasterKey)
    }

    fn owner_dir(&self, owner: &str) -> KeyResult<PathBuf> {
        if owner == GLOBAL_OWNER {
            return Ok(self.root.clone());
        }
        if !crate::service::validation::valid_slug(owner) {
            return Err(KeyError::InvalidOwner(owner.to_string()));
        }
        Ok(self.root.join(owner))
    }

    fn file_for(&self, owner: &str, status: KeyStatus) -> KeyResult<PathBuf> {
        let name = match status {
            KeyStatus::Active => ACTIVE_FILE,
            KeyStatus::Retiring => RETIRING_FILE,
        };
        Ok(self.owner_dir(owner)?.join(name))
    }

    fn read_unlocked(&self, owner: &str, status: KeyStatus) -> KeyResult<Option<StoredKey>> {
        read_key(&self.file_for(owner, status)?)
    }

    /// The owner's own key file, without the global fallback.
    pub fn load(&self, owner: &str, status: KeyStatus) -> KeyResult<Option<StoredKey>> {
        let _guard = self.lock.read();
        self.read_unlocked(owner, status)
    }

    /// The owner whose files actually serve `owner`.
    fn effective_owner<'a>(&self, owner: &'a str) -> KeyResult<&'a str> {
        if owner != GLOBAL_OWNER && !self.file_for(owner, KeyStatus::Active)?.is_file() {
            return Ok(GLOBAL_OWNER);
        }
        Ok(owner)
    }

    pub fn get_active(&self, owner: &str) -> KeyResult<StoredKey> {
        let _guard = self.lock.read();
        let effective = self.effective_owner(owner)?;
        self.read_unlocked(effective, KeyStatus::Active)?
            .ok_or_else(|| KeyError::NotFound(format!("no active key for {owner}")))
    }

    /// Active key plus the retiring key while its grace window is open.
    pub fn jwks_at(&self, owner: &str, now: DateTime<Utc>) -> KeyResult<Jwks> {
        let _guard = self.lock.read();
        let effective = self.effective_owner(owner)?;
        let mut jwks = Jwks::default();
        for status in [KeyStatus::Active, KeyStatus::Retiring] {
            if let Some(key) = self.read_unlocked(effective, status)?
                && key.in_grace(now)
            {
                jwks.keys.push(key.jwk()?);
            }
        }
        Ok(jwks)
    }

    pub fn jwks(&self, owner: &str) -> KeyResult<Jwks> {
        self.jwks_at(owner, Utc::now())
    }

    /// Write a fresh active key, replacing any existing one. Bootstrap only;
    /// rotation goes through [`KeyStore::rotate`].
    pub fn generate(&self, owner: &str, algorithm: SigningAlgorithm) -> KeyResult<StoredKey> {
        let master = self.master_key()?;
        let key = StoredKey::generate(master, owner, algorithm, Utc::now())?;
        let encoded = serde_json::to_string_pretty(&key)?;
        let _guard = self.lock.write();
        let path = self.file_for(owner, KeyStatus::Active)?;
        write_file(&path, &encoded)?;
        tracing::info!(owner, kid = %key.kid, algorithm = key.algorithm.as_str(), "signing key generated");
        Ok(key)
    }

    /// The owner's active key, generated when missing.
    pub fn ensure_active(&self, owner: &str, algorithm: SigningAlgorithm) -> KeyResult<StoredKey> {
        match self.load(owner, KeyStatus::Active)? {
            Some(key) => Ok(key),
            None => self.generate(owner, algorithm),
        }
    }

    /// Build the files a rotation would write without touching disk: the key
    /// currently serving `owner` (its own, else the global one, else a fresh
    /// one) demoted to retiring, and a new active key of the same algorithm.
    pub fn prepare_rotation(
        &self,
        owner: &str,
        grace_seconds: u64,
        now: DateTime<Utc>,
    ) -> KeyResult<RotationPayload> {
        check_grace(grace_seconds)?;
        let master = self.master_key()?;
        let serving = {
            let _guard = self.lock.read();
            let effective = self.effective_owner(owner)?;
            self.read_unlocked(effective, KeyStatus::Active)?
        };
        let current = match serving {
            Some(key) => key,
            None => StoredKey::generate(master, owner, SigningAlgorithm::default(), now)?,
        };
        let next = StoredKey::generate(master, owner, current.algorithm, now)?;
        let retiring = current.retire(now, grace_seconds);
        Ok(RotationPayload {
            active_json: serde_json::to_string_pretty(&next)?,
            retiring_json: Some(serde_json::to_string_pretty(&retiring)?),
            grace_seconds: Some(grace_seconds),
        })
    }

    /// Store rotation output byte-for-byte. The blobs are parsed only to
    /// check their shape.
    pub fn write_raw(
        &self,
        owner: &str,
        active_json: &str,
        retiring_json: Option<&str>,
    ) -> KeyResult<()> {
        let active: StoredKey = serde_json::from_str(active_json)?;
        if active.status != KeyStatus::Active {
            return Err(KeyError::Material(format!("{} is not an active key", active.kid)));
        }
        if let Some(raw) = retiring_json {
            let retiring: StoredKey = serde_json::from_str(raw)?;
            if retiring.status != KeyStatus::Retiring {
                return Err(KeyError::Material(format!("{} is not a retiring key", retiring.kid)));
            }
            check_grace(retiring.grace_seconds.unwrap_or(0))?;
        }

        let _guard = self.lock.write();
        if let Some(raw) = retiring_json {
            write_file(&self.file_for(owner, KeyStatus::Retiring)?, raw)?;
        }
        write_file(&self.file_for(owner, KeyStatus::Active)?, active_json)?;
        metrics::counter!("signing_key_rotations_total").increment(1);
        tracing::info!(owner, kid = %active.kid, "signing key rotated");
        Ok(())
    }

    /// Rotate locally: prepare and write in one step. Returns the new active key.
    pub fn rotate(&self, owner: &str, grace_seconds: u64) -> KeyResult<StoredKey> {
        let payload = self.prepare_rotation(owner, grace_seconds, Utc::now())?;
        self.write_raw(owner, &payload.active_json, payload.retiring_json.as_deref())?;
        Ok(serde_json::from_str(&payload.active_json)?)
    }

    /// Delete whichever key file carries `kid`, across every owner. No
    /// replacement is generated.
    pub fn revoke(&self, kid: &str) -> KeyResult<()> {
        let _guard = self.lock.write();
        let mut removed = 0usize;
        let mut owners = vec![GLOBAL_OWNER.to_string()];
        owners.extend(self.owners_unlocked()?);
        for owner in owners {
            for status in [KeyStatus::Active, KeyStatus::Retiring] {
                let path = self.file_for(&owner, status)?;
                if let Some(key) = read_key(&path)?
                    && key.kid == kid
                {
                    fs::remove_file(&path)?;
                    tracing::warn!(owner = %owner, kid, "signing key revoked");
                    removed += 1;
                }
            }
        }
        if removed == 0 {
            return Err(KeyError::NotFound(format!("kid {kid}")));
        }
        Ok(())
    }

    /// Drop a tenant's key directory. Missing directories are fine.
    pub fn remove_owner(&self, owner: &str) -> KeyResult<()> {
        if owner == GLOBAL_OWNER {
            return Err(KeyError::InvalidOwner(owner.to_string()));
        }
        let _guard = self.lock.write();
        let dir = self.owner_dir(owner)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Tenant slugs with a key directory.
    pub fn owners(&self) -> KeyResult<Vec<String>> {
        let _guard = self.lock.read();
        self.owners_unlocked()
    }

    fn owners_unlocked(&self) -> KeyResult<Vec<String>> {
        let mut owners = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(owners),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && crate::service::validation::valid_slug(name)
            {
                owners.push(name.to_string());
            }
        }
        owners.sort();
        Ok(owners)
    }
}

/// Reject grace windows longer than [`MAX_GRACE_SECONDS`].
pub fn check_grace(grace_seconds: u64) -> KeyResult<()> {
    if grace_seconds > MAX_GRACE_SECONDS {
        return Err(KeyError::InvalidGrace(grace_seconds));
    }
    Ok(())
}

fn read_key(path: &Path) -> KeyResult<Option<StoredKey>> {
    match read_optional(path)? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

fn write_file(path: &Path, contents: &str) -> KeyResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write(path, contents.as_bytes(), DEFAULT_FILE_MODE)?;
    Ok(())
}
