//! Data-plane users and their linked identities.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider name of the built-in password identity.
pub const PASSWORD_PROVIDER: &str = "password";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: String,
    /// Values of tenant-defined user columns, keyed by column name.
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub email_verified: bool,
    /// Set only for the password identity.
    #[serde(default)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input of an identity upsert from an external provider.
#[derive(Debug, Clone)]
pub struct IdentityUpsert {
    pub tenant_id: String,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: String,
    /// Ids for the rows that may be created.
    pub new_user_id: String,
    pub new_identity_id: String,
    pub now: DateTime<Utc>,
}

/// Outcome of an identity upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityLink {
    pub user_id: String,
    pub is_new_user: bool,
}
