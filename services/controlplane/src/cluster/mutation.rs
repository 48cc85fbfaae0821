//! Replicated mutation wire format.
//!
//! # Purpose
//! A [`Mutation`] is one committed log entry: `{type, tenantSlug, key?,
//! tsUnix, payload}` encoded as JSON. The leader builds every payload in full
//! (ids, timestamps, ciphertexts) so followers only copy values.
//!
//! # Notes
//! `payload` is written as embedded JSON. Readers also accept a JSON string
//! holding base64-encoded JSON, which older writers produced.
use crate::keys::RotationPayload;
use crate::model::{ClientType, OidcClient, Scope, Tenant, TenantSettings};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationType {
    #[serde(rename = "tenant.create")]
    TenantCreate,
    #[serde(rename = "tenant.update")]
    TenantUpdate,
    #[serde(rename = "tenant.delete")]
    TenantDelete,
    #[serde(rename = "settings.update")]
    SettingsUpdate,
    #[serde(rename = "client.create")]
    ClientCreate,
    #[serde(rename = "client.update")]
    ClientUpdate,
    #[serde(rename = "client.delete")]
    ClientDelete,
    #[serde(rename = "scope.create")]
    ScopeCreate,
    #[serde(rename = "scope.delete")]
    ScopeDelete,
    #[serde(rename = "key.rotate")]
    KeyRotate,
}

impl MutationType {
    pub const ALL: [MutationType; 10] = [
        MutationType::TenantCreate,
        MutationType::TenantUpdate,
        MutationType::TenantDelete,
        MutationType::SettingsUpdate,
        MutationType::ClientCreate,
        MutationType::ClientUpdate,
        MutationType::ClientDelete,
        MutationType::ScopeCreate,
        MutationType::ScopeDelete,
        MutationType::KeyRotate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MutationType::TenantCreate => "tenant.create",
            MutationType::TenantUpdate => "tenant.update",
            MutationType::TenantDelete => "tenant.delete",
            MutationType::SettingsUpdate => "settings.update",
            MutationType::ClientCreate => "client.create",
            MutationType::ClientUpdate => "client.update",
            MutationType::ClientDelete => "client.delete",
            MutationType::ScopeCreate => "scope.create",
            MutationType::ScopeDelete => "scope.delete",
            MutationType::KeyRotate => "key.rotate",
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("mutation codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("mutation payload: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    #[serde(rename = "type")]
    pub kind: MutationType,
    pub tenant_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub ts_unix: i64,
    #[serde(deserialize_with = "payload_from_wire")]
    pub payload: serde_json::Value,
}

fn payload_from_wire<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    match raw {
        serde_json::Value::String(encoded) => {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(serde::de::Error::custom)?;
            serde_json::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
        other => Ok(other),
    }
}

impl Mutation {
    pub fn new<P: Serialize>(
        kind: MutationType,
        tenant_slug: impl Into<String>,
        at: DateTime<Utc>,
        payload: &P,
    ) -> Result<Self, MutationError> {
        Ok(Self {
            kind,
            tenant_slug: tenant_slug.into(),
            key: None,
            ts_unix: at.timestamp(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, MutationError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MutationError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, MutationError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|err| MutationError::Payload(format!("{}: {err}", self.kind)))
    }

    /// Submission time as recorded by the leader.
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.ts_unix, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn client_upsert(
        kind: MutationType,
        tenant: &str,
        client: &OidcClient,
        at: DateTime<Utc>,
    ) -> Result<Self, MutationError> {
        Ok(Self::new(kind, tenant, at, &ClientPayload::from(client))?.with_key(&client.client_id))
    }

    pub fn client_delete(tenant: &str, client_id: &str, at: DateTime<Utc>) -> Result<Self, MutationError> {
        Ok(Self::new(MutationType::ClientDelete, tenant, at, &DeletePayload::new(client_id))?
            .with_key(client_id))
    }

    pub fn tenant_upsert(kind: MutationType, tenant: &Tenant, at: DateTime<Utc>) -> Result<Self, MutationError> {
        Self::new(kind, &tenant.slug, at, &TenantPayload::from(tenant))
    }

    pub fn tenant_delete(slug: &str, at: DateTime<Utc>) -> Result<Self, MutationError> {
        Self::new(MutationType::TenantDelete, slug, at, &DeletePayload::new(slug))
    }

    pub fn settings_update(
        slug: &str,
        settings: &TenantSettings,
        at: DateTime<Utc>,
    ) -> Result<Self, MutationError> {
        Self::new(
            MutationType::SettingsUpdate,
            slug,
            at,
            &SettingsPayload {
                settings: settings.clone(),
            },
        )
    }

    pub fn scope_create(tenant: &str, scope: &Scope, at: DateTime<Utc>) -> Result<Self, MutationError> {
        Ok(Self::new(MutationType::ScopeCreate, tenant, at, scope)?.with_key(&scope.name))
    }

    /// The scope name travels in `id`.
    pub fn scope_delete(tenant: &str, name: &str, at: DateTime<Utc>) -> Result<Self, MutationError> {
        Ok(Self::new(MutationType::ScopeDelete, tenant, at, &DeletePayload::new(name))?.with_key(name))
    }

    pub fn key_rotate(owner: &str, rotation: &RotationPayload, at: DateTime<Utc>) -> Result<Self, MutationError> {
        Self::new(MutationType::KeyRotate, owner, at, rotation)
    }
}

/// `client.create` / `client.update` payload. `secret` carries the sealed
/// secret, never plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPayload {
    pub client_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub require_email_verification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_password_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_email_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claim_mapping: BTreeMap<String, String>,
}

impl From<&OidcClient> for ClientPayload {
    fn from(client: &OidcClient) -> Self {
        Self {
            client_id: client.client_id.clone(),
            name: client.name.clone(),
            client_type: client.client_type,
            secret: client.secret_enc.clone(),
            redirect_uris: client.redirect_uris.clone(),
            allowed_origins: client.allowed_origins.clone(),
            providers: client.providers.clone(),
            scopes: client.scopes.clone(),
            require_email_verification: client.require_email_verification,
            reset_password_url: client.reset_password_url.clone(),
            verify_email_url: client.verify_email_url.clone(),
            claim_schema: client.claim_schema.clone(),
            claim_mapping: client.claim_mapping.clone(),
        }
    }
}

impl From<ClientPayload> for OidcClient {
    fn from(payload: ClientPayload) -> Self {
        Self {
            client_id: payload.client_id,
            name: payload.name,
            client_type: payload.client_type,
            redirect_uris: payload.redirect_uris,
            allowed_origins: payload.allowed_origins,
            providers: payload.providers,
            scopes: payload.scopes,
            secret: String::new(),
            secret_enc: payload.secret,
            require_email_verification: payload.require_email_verification,
            reset_password_url: payload.reset_password_url,
            verify_email_url: payload.verify_email_url,
            claim_schema: payload.claim_schema,
            claim_mapping: payload.claim_mapping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub id: String,
}

impl DeletePayload {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// `tenant.create` / `tenant.update` payload. Settings secrets are already
/// sealed. Missing timestamps fall back to the mutation's own `tsUnix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPayload {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub settings: TenantSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Tenant> for TenantPayload {
    fn from(tenant: &Tenant) -> Self {
        let mut settings = tenant.settings.clone();
        settings.clear_plaintext();
        Self {
            id: tenant.id.clone(),
            name: tenant.name.clone(),
            slug: tenant.slug.clone(),
            language: Some(tenant.language.clone()),
            settings,
            created_at: Some(tenant.created_at),
            updated_at: Some(tenant.updated_at),
        }
    }
}

impl TenantPayload {
    pub fn into_tenant(self, fallback: DateTime<Utc>) -> Tenant {
        let created_at = self.created_at.unwrap_or(fallback);
        Tenant {
            id: self.id,
            slug: self.slug,
            name: self.name,
            language: self.language.unwrap_or_else(|| "en".to_string()),
            settings: self.settings,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsPayload {
    pub settings: TenantSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_client() -> OidcClient {
        OidcClient {
            client_id: "web".into(),
            name: "Web".into(),
            client_type: ClientType::Confidential,
            redirect_uris: vec!["http://localhost:3000/cb".into()],
            allowed_origins: Vec::new(),
            providers: Vec::new(),
            scopes: vec!["openid".into(), "profile".into()],
            secret: "s3cret".into(),
            secret_enc: "bm9uY2U=|Y2lwaGVy".into(),
            require_email_verification: false,
            reset_password_url: None,
            verify_email_url: None,
            claim_schema: None,
            claim_mapping: BTreeMap::new(),
        }
    }

    #[test]
    fn type_names_match_the_wire() {
        for kind in MutationType::ALL {
            let encoded = serde_json::to_string(&kind).unwrap();
            assert_eq!(encoded, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn client_payload_carries_only_the_sealed_secret() {
        let mutation = Mutation::client_upsert(
            MutationType::ClientCreate,
            "acme",
            &web_client(),
            DateTime::UNIX_EPOCH,
        )
        .unwrap();
        let wire = String::from_utf8(mutation.encode().unwrap()).unwrap();
        assert!(wire.contains(r#""type":"client.create""#));
        assert!(wire.contains(r#""tenantSlug":"acme""#));
        assert!(wire.contains(r#""secret":"bm9uY2U=|Y2lwaGVy""#));
        assert!(!wire.contains("s3cret"));

        let client: OidcClient = mutation.payload_as::<ClientPayload>().unwrap().into();
        assert!(client.secret.is_empty());
        assert_eq!(client.secret_enc, "bm9uY2U=|Y2lwaGVy");
        assert_eq!(mutation.key.as_deref(), Some("web"));
    }

    #[test]
    fn base64_payloads_are_accepted() {
        let inner = STANDARD.encode(br#"{"id":"openid"}"#);
        let wire = format!(
            r#"{{"type":"scope.delete","tenantSlug":"acme","tsUnix":1700000000,"payload":"{inner}"}}"#
        );
        let mutation = Mutation::decode(wire.as_bytes()).unwrap();
        assert_eq!(mutation.kind, MutationType::ScopeDelete);
        assert_eq!(mutation.payload_as::<DeletePayload>().unwrap().id, "openid");
        assert_eq!(mutation.timestamp().timestamp(), 1_700_000_000);
    }

    #[test]
    fn encoding_is_stable() {
        let mutation = Mutation::client_upsert(
            MutationType::ClientUpdate,
            "acme",
            &web_client(),
            DateTime::UNIX_EPOCH,
        )
        .unwrap();
        let first = mutation.encode().unwrap();
        let again = Mutation::decode(&first).unwrap().encode().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn tenant_payload_falls_back_to_mutation_time() {
        let payload: TenantPayload =
            serde_json::from_str(r#"{"id":"t1","name":"Acme","slug":"acme"}"#).unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let tenant = payload.into_tenant(at);
        assert_eq!(tenant.created_at, at);
        assert_eq!(tenant.updated_at, at);
        assert_eq!(tenant.language, "en");
    }

    #[test]
    fn unknown_types_are_rejected() {
        let wire = r#"{"type":"user.create","tenantSlug":"acme","tsUnix":0,"payload":{}}"#;
        assert!(Mutation::decode(wire.as_bytes()).is_err());
    }
}
