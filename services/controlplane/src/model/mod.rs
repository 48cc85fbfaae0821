//! Control-plane data model.
//!
//! # Purpose
//! Entity types shared by the repositories, the replicated applier and the
//! service layer. Control-plane entities (tenant, client, scope, claims,
//! admin) serialize as camelCase YAML; data-plane entities map to SQL rows.
mod access;
mod admin;
mod client;
mod consent;
mod scope;
mod session;
mod tenant;
mod token;
mod user;

pub use access::{MfaFactor, Role};
pub use admin::{Admin, AdminRefreshToken, AdminType};
pub use client::{ClientType, OidcClient};
pub use consent::Consent;
pub use scope::{ClaimsConfig, CustomClaim, SYSTEM_SCOPES, Scope, is_system_scope};
pub use session::{DEFAULT_IDLE_TIMEOUT, Session, SessionFilter, SessionStatus, SessionView};
pub use tenant::{
    Branding, CacheSettings, ConsentPolicy, EmailTemplate, IssuerMode, MailingSettings,
    MfaPolicy, SecurityPolicy, SmtpSettings, SocialProvider, Tenant, TenantSettings,
    UserDbSettings, UserFieldDef, UserFieldType,
};
pub use token::{
    EmailToken, EmailTokenPurpose, RefreshToken, TokenStats, generate_token, hash_token,
};
pub use user::{Identity, IdentityLink, IdentityUpsert, PASSWORD_PROVIDER, User};
