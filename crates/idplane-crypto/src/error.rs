use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The key is not 32 bytes in any accepted encoding.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// No master key has been loaded.
    #[error("master key not configured: {0}")]
    MissingKey(&'static str),
    /// AEAD verification failed.
    #[error("authentication failed")]
    AuthFailed,
    /// The sealed value is not in `nonce|ciphertext` form.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}
