//! Signing key material and its on-disk record.
//!
//! # Purpose
//! Generates Ed25519 and P-256 key pairs, wraps the PKCS8 private key under the
//! signing master key, and converts public PEMs into JWK entries.
//!
//! # Key invariants
//! - `private_key_enc` is `base64(nonce || ciphertext+tag)`; the unwrapped DER
//!   never reaches disk or logs.
//! - Public keys are stored as PKIX (SPKI) PEM.
use super::{KeyError, KeyResult};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use idplane_crypto::SigningMasterKey;
use jsonwebtoken::EncodingKey;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Longest grace window a retiring key may carry (ten years).
pub const MAX_GRACE_SECONDS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[default]
    EdDSA,
    ES256,
}

impl SigningAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SigningAlgorithm::EdDSA => "EdDSA",
            SigningAlgorithm::ES256 => "ES256",
        }
    }

    pub fn jwt_algorithm(self) -> jsonwebtoken::Algorithm {
        match self {
            SigningAlgorithm::EdDSA => jsonwebtoken::Algorithm::EdDSA,
            SigningAlgorithm::ES256 => jsonwebtoken::Algorithm::ES256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retiring,
}

/// One `active.json` / `retiring.json` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    pub private_key_enc: String,
    pub public_key_pem: String,
    pub status: KeyStatus,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredKey {
    /// Generate a fresh active key. `prefix` names the owner (tenant slug or
    /// `global`) and is followed by the creation second and a random suffix.
    pub fn generate(
        master: &SigningMasterKey,
        prefix: &str,
        algorithm: SigningAlgorithm,
        now: DateTime<Utc>,
    ) -> KeyResult<Self> {
        let (der, public_key_pem) = match algorithm {
            SigningAlgorithm::EdDSA => ed25519_pair()?,
            SigningAlgorithm::ES256 => p256_pair()?,
        };
        let wrapped = master.wrap(&der)?;
        Ok(Self {
            kid: new_kid(prefix, now),
            algorithm,
            private_key_enc: STANDARD.encode(wrapped),
            public_key_pem,
            status: KeyStatus::Active,
            not_before: now,
            created_at: now,
            retired_at: None,
            grace_seconds: None,
            expires_at: None,
        })
    }

    /// The same key demoted to retiring at `at` with a grace window. The
    /// window end is recorded as `expires_at`.
    pub fn retire(mut self, at: DateTime<Utc>, grace_seconds: u64) -> Self {
        self.status = KeyStatus::Retiring;
        self.retired_at = Some(at);
        self.grace_seconds = Some(grace_seconds);
        self.expires_at = grace_end(at, grace_seconds);
        self
    }

    /// Whether a retiring key is still published at `now`. Active keys always
    /// are. A window too large to represent never closes.
    pub fn in_grace(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.retired_at) {
            (KeyStatus::Active, _) => true,
            (KeyStatus::Retiring, Some(retired_at)) => {
                match grace_end(retired_at, self.grace_seconds.unwrap_or(0)) {
                    Some(end) => now < end,
                    None => true,
                }
            }
            (KeyStatus::Retiring, None) => false,
        }
    }

    /// Unwrapped PKCS8 DER of the private key.
    pub fn private_der(&self, master: &SigningMasterKey) -> KeyResult<Vec<u8>> {
        let wrapped = STANDARD
            .decode(&self.private_key_enc)
            .map_err(|err| KeyError::Material(format!("private_key_enc: {err}")))?;
        Ok(master.unwrap(&wrapped)?)
    }

    pub fn encoding_key(&self, master: &SigningMasterKey) -> KeyResult<EncodingKey> {
        let der = self.private_der(master)?;
        Ok(match self.algorithm {
            SigningAlgorithm::EdDSA => EncodingKey::from_ed_der(&der),
            SigningAlgorithm::ES256 => EncodingKey::from_ec_der(&der),
        })
    }

    pub fn jwk(&self) -> KeyResult<Jwk> {
        match self.algorithm {
            SigningAlgorithm::EdDSA => {
                use ed25519_dalek::pkcs8::DecodePublicKey;
                let key = ed25519_dalek::VerifyingKey::from_public_key_pem(&self.public_key_pem)
                    .map_err(|err| KeyError::Material(format!("ed25519 public key: {err}")))?;
                Ok(Jwk {
                    kty: "OKP".into(),
                    kid: self.kid.clone(),
                    alg: self.algorithm.as_str().into(),
                    use_field: "sig".into(),
                    crv: "Ed25519".into(),
                    x: URL_SAFE_NO_PAD.encode(key.to_bytes()),
                    y: None,
                    exp: self.expires_at.map(|at| at.timestamp()),
                })
            }
            SigningAlgorithm::ES256 => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                use p256::pkcs8::DecodePublicKey;
                let key = p256::PublicKey::from_public_key_pem(&self.public_key_pem)
                    .map_err(|err| KeyError::Material(format!("p256 public key: {err}")))?;
                let point = key.to_encoded_point(false);
                let (Some(x), Some(y)) = (point.x(), point.y()) else {
                    return Err(KeyError::Material("p256 point at infinity".into()));
                };
                Ok(Jwk {
                    kty: "EC".into(),
                    kid: self.kid.clone(),
                    alg: self.algorithm.as_str().into(),
                    use_field: "sig".into(),
                    crv: "P-256".into(),
                    x: URL_SAFE_NO_PAD.encode(x),
                    y: Some(URL_SAFE_NO_PAD.encode(y)),
                    exp: self.expires_at.map(|at| at.timestamp()),
                })
            }
        }
    }
}

/// A public JWK entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub use_field: String,
    pub crv: String,
    pub x: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// Unix time after which a retiring key leaves the set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    pub fn kids(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.kid.as_str()).collect()
    }
}

fn grace_end(at: DateTime<Utc>, grace_seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(grace_seconds).ok()?;
    at.checked_add_signed(chrono::Duration::try_seconds(seconds)?)
}

fn new_kid(prefix: &str, now: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 6];
    OsRng.fill_bytes(&mut suffix);
    format!("{prefix}-{}-{}", now.format("%Y%m%d%H%M%S"), hex::encode(suffix))
}

fn ed25519_pair() -> KeyResult<(Vec<u8>, String)> {
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};

    let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
    let der = signing
        .to_pkcs8_der()
        .map_err(|err| KeyError::Material(format!("encode ed25519 key: {err}")))?;
    let pem = signing
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| KeyError::Material(format!("encode ed25519 public key: {err}")))?;
    Ok((der.as_bytes().to_vec(), pem))
}

fn p256_pair() -> KeyResult<(Vec<u8>, String)> {
    use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    let secret = p256::SecretKey::random(&mut OsRng);
    let der = secret
        .to_pkcs8_der()
        .map_err(|err| KeyError::Material(format!("encode p256 key: {err}")))?;
    let pem = secret
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| KeyError::Material(format!("encode p256 public key: {err}")))?;
    Ok((der.as_bytes().to_vec(), pem))
}
