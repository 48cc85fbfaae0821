//! Repository layer.
//!
//! # Purpose
//! Defines the repository contracts and error taxonomy, the adapter registry
//! that turns an adapter name plus [`AdapterConfig`] into a live
//! [`Connection`], and the [`DataAccess`] aggregate the rest of the crate
//! consumes.
//!
//! # Notes
//! A connection exposes one accessor per repository. Accessors for
//! repositories the adapter does not support return `None`; [`DataAccess`]
//! turns that into `NotImplemented` for callers.
use crate::keys::KeyStore;
use async_trait::async_trait;
use std::sync::Arc;

mod dal;
mod error;
pub mod fs;
pub mod noop;
pub mod postgres;
mod registry;
mod repository;

pub use dal::{DataAccess, RepositoryHealth};
pub use error::{StoreError, StoreErrorKind, StoreResult};
pub use registry::{AdapterConfig, AdapterFactory, AdapterRegistry};
pub use repository::{
    AdminRepository, AdminTokenRepository, ClaimsRepository, ClientRepository, ColumnInfo,
    ConsentRepository, EmailTokenRepository, FieldSyncReport, IdentityRepository, MfaRepository,
    RbacRepository, RefreshTokenRepository, SchemaRepository, ScopeRepository,
    SessionRepository, TenantRepository, UserRepository,
};

/// A live adapter connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn tenants(&self) -> Option<Arc<dyn TenantRepository>> {
        None
    }
    fn clients(&self) -> Option<Arc<dyn ClientRepository>> {
        None
    }
    fn scopes(&self) -> Option<Arc<dyn ScopeRepository>> {
        None
    }
    fn claims(&self) -> Option<Arc<dyn ClaimsRepository>> {
        None
    }
    fn admins(&self) -> Option<Arc<dyn AdminRepository>> {
        None
    }
    fn admin_tokens(&self) -> Option<Arc<dyn AdminTokenRepository>> {
        None
    }
    fn keys(&self) -> Option<KeyStore> {
        None
    }

    fn users(&self) -> Option<Arc<dyn UserRepository>> {
        None
    }
    fn identities(&self) -> Option<Arc<dyn IdentityRepository>> {
        None
    }
    fn refresh_tokens(&self) -> Option<Arc<dyn RefreshTokenRepository>> {
        None
    }
    fn sessions(&self) -> Option<Arc<dyn SessionRepository>> {
        None
    }
    fn consents(&self) -> Option<Arc<dyn ConsentRepository>> {
        None
    }
    fn mfa(&self) -> Option<Arc<dyn MfaRepository>> {
        None
    }
    fn rbac(&self) -> Option<Arc<dyn RbacRepository>> {
        None
    }
    fn email_tokens(&self) -> Option<Arc<dyn EmailTokenRepository>> {
        None
    }
    fn schema(&self) -> Option<Arc<dyn SchemaRepository>> {
        None
    }

    async fn ping(&self) -> StoreResult<()>;

    /// Release resources. Safe to call more than once.
    async fn close(&self);
}
