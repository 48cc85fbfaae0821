//! Repository error taxonomy.
//!
//! Every adapter reports one of a fixed set of kinds, each carrying a context
//! string. Callers classify with [`StoreError::kind`] or the `is_*` helpers
//! instead of matching on backend error types.
use idplane_crypto::CryptoError;
use idplane_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    NotImplemented,
    NoDatabase,
    Unauthorized,
    TokenExpired,
    LastIdentity,
    AuthFailed,
    LockTimeout,
    Closed,
    Internal,
}

impl StoreErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorKind::NotFound => "not_found",
            StoreErrorKind::Conflict => "conflict",
            StoreErrorKind::InvalidInput => "invalid_input",
            StoreErrorKind::NotImplemented => "not_implemented",
            StoreErrorKind::NoDatabase => "no_database",
            StoreErrorKind::Unauthorized => "unauthorized",
            StoreErrorKind::TokenExpired => "token_expired",
            StoreErrorKind::LastIdentity => "last_identity",
            StoreErrorKind::AuthFailed => "auth_failed",
            StoreErrorKind::LockTimeout => "lock_timeout",
            StoreErrorKind::Closed => "closed",
            StoreErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("no database: {0}")]
    NoDatabase(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("token expired: {0}")]
    TokenExpired(String),
    #[error("last identity: {0}")]
    LastIdentity(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("closed: {0}")]
    Closed(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::NotFound(_) => StoreErrorKind::NotFound,
            StoreError::Conflict(_) => StoreErrorKind::Conflict,
            StoreError::InvalidInput(_) => StoreErrorKind::InvalidInput,
            StoreError::NotImplemented(_) => StoreErrorKind::NotImplemented,
            StoreError::NoDatabase(_) => StoreErrorKind::NoDatabase,
            StoreError::Unauthorized(_) => StoreErrorKind::Unauthorized,
            StoreError::TokenExpired(_) => StoreErrorKind::TokenExpired,
            StoreError::LastIdentity(_) => StoreErrorKind::LastIdentity,
            StoreError::AuthFailed(_) => StoreErrorKind::AuthFailed,
            StoreError::LockTimeout(_) => StoreErrorKind::LockTimeout,
            StoreError::Closed(_) => StoreErrorKind::Closed,
            StoreError::Unexpected(_) => StoreErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == StoreErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == StoreErrorKind::Conflict
    }

    pub fn is_no_database(&self) -> bool {
        self.kind() == StoreErrorKind::NoDatabase
    }

    /// Prefix the message with `ctx`, keeping the kind.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        let wrap = |msg: String| format!("{ctx}: {msg}");
        match self {
            StoreError::NotFound(m) => StoreError::NotFound(wrap(m)),
            StoreError::Conflict(m) => StoreError::Conflict(wrap(m)),
            StoreError::InvalidInput(m) => StoreError::InvalidInput(wrap(m)),
            StoreError::NotImplemented(m) => StoreError::NotImplemented(wrap(m)),
            StoreError::NoDatabase(m) => StoreError::NoDatabase(wrap(m)),
            StoreError::Unauthorized(m) => StoreError::Unauthorized(wrap(m)),
            StoreError::TokenExpired(m) => StoreError::TokenExpired(wrap(m)),
            StoreError::LastIdentity(m) => StoreError::LastIdentity(wrap(m)),
            StoreError::AuthFailed(m) => StoreError::AuthFailed(wrap(m)),
            StoreError::LockTimeout(m) => StoreError::LockTimeout(wrap(m)),
            StoreError::Closed(m) => StoreError::Closed(wrap(m)),
            StoreError::Unexpected(err) => StoreError::Unexpected(err.context(ctx.to_string())),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            // lock_not_available, raised when lock_timeout expires.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("55P03") => {
                StoreError::LockTimeout(db.message().to_string())
            }
            _ => StoreError::Unexpected(err.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<CryptoError> for StoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthFailed => StoreError::AuthFailed("secret verification failed".into()),
            other => StoreError::Unexpected(other.into()),
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_the_kind() {
        let err = StoreError::NotFound("client web".into()).context("tenant acme");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: tenant acme: client web");

        let err = StoreError::Unexpected(anyhow::anyhow!("disk full")).context("write clients");
        assert_eq!(err.kind(), StoreErrorKind::Internal);
        assert!(format!("{err:#}").contains("disk full"));
    }

    #[test]
    fn crypto_auth_failure_maps_to_auth_failed() {
        let err: StoreError = CryptoError::AuthFailed.into();
        assert_eq!(err.kind(), StoreErrorKind::AuthFailed);
        let err: StoreError = CryptoError::MissingKey("SECRETBOX_MASTER_KEY").into();
        assert_eq!(err.kind(), StoreErrorKind::Internal);
    }
}
