use crate::error::{CryptoError, CryptoResult};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// A 256-bit AES-GCM key. The bytes are zeroed when the last copy drops.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a key string, see [`parse_key`].
    pub fn parse(value: &str) -> CryptoResult<Self> {
        parse_key(value).map(Self::from_bytes)
    }

    /// Decode a key that must be base64 (padded or unpadded).
    pub fn from_base64(value: &str) -> CryptoResult<Self> {
        let trimmed = value.trim();
        let decoded = decode_base64(trimmed)
            .ok_or_else(|| CryptoError::InvalidKey("value is not base64".into()))?;
        to_key_bytes(&decoded).map(Self::from_bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Seal `plaintext` and return `nonce || ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.as_bytes()));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Malformed("encryption failed".into()))?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// Open a `nonce || ciphertext+tag` buffer produced by [`MasterKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN + 16 {
            return Err(CryptoError::Malformed("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.open_parts(nonce, ciphertext)
    }

    pub(crate) fn open_parts(&self, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Malformed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthFailed)
    }

    /// Seal a UTF-8 string into the `base64(nonce)|base64(ciphertext)` form.
    pub fn encrypt_string(&self, plaintext: &str) -> CryptoResult<String> {
        let sealed = self.seal(plaintext.as_bytes())?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        Ok(format!(
            "{}|{}",
            STANDARD.encode(nonce),
            STANDARD.encode(ciphertext)
        ))
    }

    pub fn decrypt_string(&self, encoded: &str) -> CryptoResult<String> {
        let (nonce_b64, ciphertext_b64) = encoded
            .split_once('|')
            .ok_or_else(|| CryptoError::Malformed("missing '|' separator".into()))?;
        let nonce = STANDARD
            .decode(nonce_b64)
            .map_err(|err| CryptoError::Malformed(format!("nonce base64: {err}")))?;
        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .map_err(|err| CryptoError::Malformed(format!("ciphertext base64: {err}")))?;
        let plaintext = self.open_parts(&nonce, &ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Malformed("plaintext is not utf-8".into()))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Decode a 32-byte key from base64 (padded or unpadded, standard or URL
/// alphabet), 64 hex characters, or 32 raw bytes.
///
/// ```
/// use idplane_crypto::parse_key;
///
/// let hex_key = "00".repeat(32);
/// assert_eq!(parse_key(&hex_key).unwrap(), [0u8; 32]);
/// assert!(parse_key("too-short").is_err());
/// ```
pub fn parse_key(value: &str) -> CryptoResult<[u8; KEY_LEN]> {
    let trimmed = value.trim();
    if trimmed.len() == KEY_LEN * 2 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        let decoded =
            hex::decode(trimmed).map_err(|err| CryptoError::InvalidKey(format!("hex: {err}")))?;
        return to_key_bytes(&decoded);
    }
    if let Some(decoded) = decode_base64(trimmed)
        && decoded.len() == KEY_LEN
    {
        return to_key_bytes(&decoded);
    }
    if value.len() == KEY_LEN {
        return to_key_bytes(value.as_bytes());
    }
    Err(CryptoError::InvalidKey(format!(
        "expected 32 bytes as base64, hex or raw (got {} characters)",
        value.len()
    )))
}

fn decode_base64(value: &str) -> Option<Vec<u8>> {
    [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(value).ok())
}

fn to_key_bytes(bytes: &[u8]) -> CryptoResult<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("key must be {KEY_LEN} bytes, got {}", bytes.len()))
    })
}
