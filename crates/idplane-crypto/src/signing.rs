//! Master key used to wrap signing private keys at rest.
//!
//! Distinct from the secretbox key: it is injected into the key store rather
//! than held globally, and it may be rotated independently.
use crate::error::CryptoResult;
use crate::key::MasterKey;
use std::fmt;

pub const SIGNING_MASTER_KEY_ENV: &str = "SIGNING_MASTER_KEY";

#[derive(Clone)]
pub struct SigningMasterKey(MasterKey);

impl SigningMasterKey {
    /// Parse hex, base64, or raw 32 bytes.
    pub fn parse(value: &str) -> CryptoResult<Self> {
        MasterKey::parse(value).map(Self)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(MasterKey::from_bytes(bytes))
    }

    /// Read `SIGNING_MASTER_KEY`; `Ok(None)` when unset or empty.
    pub fn from_env() -> CryptoResult<Option<Self>> {
        match std::env::var(SIGNING_MASTER_KEY_ENV) {
            Ok(value) if !value.trim().is_empty() => Self::parse(&value).map(Some),
            _ => Ok(None),
        }
    }

    /// Returns `nonce || ciphertext+tag`.
    pub fn wrap(&self, private_key: &[u8]) -> CryptoResult<Vec<u8>> {
        self.0.seal(private_key)
    }

    pub fn unwrap(&self, wrapped: &[u8]) -> CryptoResult<Vec<u8>> {
        self.0.open(wrapped)
    }
}

impl fmt::Debug for SigningMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningMasterKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;

    #[test]
    fn wrap_unwrap_round_trip() {
        let key = SigningMasterKey::parse(&"11".repeat(32)).unwrap();
        let wrapped = key.wrap(&[42u8; 32]).unwrap();
        assert_ne!(&wrapped[12..44], &[42u8; 32]);
        assert_eq!(key.unwrap(&wrapped).unwrap(), vec![42u8; 32]);
    }

    #[test]
    fn unwrap_with_other_key_fails() {
        let key = SigningMasterKey::from_bytes([1u8; 32]);
        let other = SigningMasterKey::from_bytes([2u8; 32]);
        let wrapped = key.wrap(b"seed").unwrap();
        assert_eq!(other.unwrap(&wrapped), Err(CryptoError::AuthFailed));
    }
}
