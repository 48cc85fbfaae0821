//! Process-wide secretbox keyed by `SECRETBOX_MASTER_KEY`.
//!
//! # Notes
//! The master key is loaded once and cached under a lock; later loads are
//! no-ops that keep the cached key. Callers only ever hold a short-lived clone
//! of the key for the duration of one seal/open.
use crate::error::{CryptoError, CryptoResult};
use crate::key::MasterKey;
use parking_lot::RwLock;
use std::sync::LazyLock;

pub const MASTER_KEY_ENV: &str = "SECRETBOX_MASTER_KEY";

static MASTER_KEY: LazyLock<RwLock<Option<MasterKey>>> = LazyLock::new(|| RwLock::new(None));

/// Load the master key from `SECRETBOX_MASTER_KEY` (base64 of 32 bytes).
pub fn init_from_env() -> CryptoResult<()> {
    if is_initialized() {
        return Ok(());
    }
    let value = std::env::var(MASTER_KEY_ENV).map_err(|_| CryptoError::MissingKey(MASTER_KEY_ENV))?;
    load_master_key(&value)
}

/// Install the master key from its base64 form. Idempotent: once a key is
/// cached, later calls keep it and return `Ok`.
pub fn load_master_key(value: &str) -> CryptoResult<()> {
    let mut guard = MASTER_KEY.write();
    if guard.is_some() {
        return Ok(());
    }
    *guard = Some(MasterKey::from_base64(value)?);
    Ok(())
}

pub fn is_initialized() -> bool {
    MASTER_KEY.read().is_some()
}

/// Clear the cached key so a test can install a different one.
#[doc(hidden)]
pub fn reset_for_tests() {
    *MASTER_KEY.write() = None;
}

fn current_key() -> CryptoResult<MasterKey> {
    MASTER_KEY
        .read()
        .clone()
        .ok_or(CryptoError::MissingKey(MASTER_KEY_ENV))
}

/// Seal `plaintext` with the process master key.
pub fn encrypt(plaintext: &str) -> CryptoResult<String> {
    current_key()?.encrypt_string(plaintext)
}

pub fn decrypt(encoded: &str) -> CryptoResult<String> {
    current_key()?.decrypt_string(encoded)
}

/// Seal with an explicit key string (base64, hex, or raw 32 bytes).
pub fn encrypt_with_key(key: &str, plaintext: &str) -> CryptoResult<String> {
    MasterKey::parse(key)?.encrypt_string(plaintext)
}

pub fn decrypt_with_key(key: &str, encoded: &str) -> CryptoResult<String> {
    MasterKey::parse(key)?.decrypt_string(encoded)
}
