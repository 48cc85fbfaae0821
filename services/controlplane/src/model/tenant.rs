//! Tenant records and the tenant settings aggregate.
//!
//! # Purpose
//! Defines the `tenant.yaml` document: identity fields plus every per-tenant
//! setting (branding, TTLs, SMTP, user database, cache, security policy, user
//! fields, mailing templates, issuer mode, social providers, consent policy).
//!
//! # Key invariants
//! - Secret fields exist twice: a plaintext input field that is never
//!   serialized when empty, and its `*Enc` ciphertext. Persisted documents
//!   carry only the ciphertext.
//! - Maps are `BTreeMap` so serialized output is byte-stable.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub settings: TenantSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantSettings {
    pub branding: Branding,
    pub session_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub mfa: MfaPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_db: Option<UserDbSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSettings>,
    pub security: SecurityPolicy,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_fields: Vec<UserFieldDef>,
    pub mailing: MailingSettings,
    pub issuer_mode: IssuerMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_override: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub social: BTreeMap<String, SocialProvider>,
    pub consent: ConsentPolicy,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            branding: Branding::default(),
            session_ttl_secs: 24 * 60 * 60,
            refresh_token_ttl_secs: 30 * 24 * 60 * 60,
            mfa: MfaPolicy::default(),
            smtp: None,
            user_db: None,
            cache: None,
            security: SecurityPolicy::default(),
            user_fields: Vec::new(),
            mailing: MailingSettings::default(),
            issuer_mode: IssuerMode::Global,
            issuer_override: None,
            social: BTreeMap::new(),
            consent: ConsentPolicy::default(),
        }
    }
}

impl TenantSettings {
    /// Drop every plaintext secret, keeping only ciphertexts.
    pub fn clear_plaintext(&mut self) {
        if let Some(smtp) = self.smtp.as_mut() {
            smtp.password.clear();
        }
        if let Some(db) = self.user_db.as_mut() {
            db.dsn.clear();
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.password.clear();
        }
        for provider in self.social.values_mut() {
            provider.client_secret.clear();
        }
    }

    /// True when any plaintext secret field is still populated.
    pub fn has_plaintext(&self) -> bool {
        self.smtp.as_ref().is_some_and(|s| !s.password.is_empty())
            || self.user_db.as_ref().is_some_and(|d| !d.dsn.is_empty())
            || self.cache.as_ref().is_some_and(|c| !c.password.is_empty())
            || self.social.values().any(|p| !p.client_secret.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Branding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MfaPolicy {
    pub required: bool,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password_enc: String,
    pub from_addr: String,
    pub use_tls: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserDbSettings {
    pub driver: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dsn: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dsn_enc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Migrations are managed outside the control plane.
    pub manual_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub driver: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password_enc: String,
    pub db: i64,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityPolicy {
    pub password_min_length: u32,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
    pub max_failed_logins: u32,
    pub lockout_minutes: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            password_min_length: 10,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_symbol: false,
            max_failed_logins: 5,
            lockout_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserFieldType {
    Text,
    Int,
    Bool,
    Date,
    Json,
}

impl UserFieldType {
    pub fn sql_type(self) -> &'static str {
        match self {
            UserFieldType::Text => "TEXT",
            UserFieldType::Int => "BIGINT",
            UserFieldType::Bool => "BOOLEAN",
            UserFieldType::Date => "DATE",
            UserFieldType::Json => "JSONB",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: UserFieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailingSettings {
    /// language -> template name -> template
    pub templates: BTreeMap<String, BTreeMap<String, EmailTemplate>>,
}

impl MailingSettings {
    /// Built-in `verify_email`, `reset_password` and `welcome` templates in
    /// English and Spanish.
    pub fn defaults() -> Self {
        let entries: [(&str, &str, &str, &str); 6] = [
            (
                "en",
                "verify_email",
                "Verify your email",
                "Hello {{name}}, confirm your address: {{link}}",
            ),
            (
                "en",
                "reset_password",
                "Reset your password",
                "Hello {{name}}, reset your password here: {{link}}",
            ),
            ("en", "welcome", "Welcome to {{tenant}}", "Hello {{name}}, welcome aboard."),
            (
                "es",
                "verify_email",
                "Verifica tu correo",
                "Hola {{name}}, confirma tu dirección: {{link}}",
            ),
            (
                "es",
                "reset_password",
                "Restablece tu contraseña",
                "Hola {{name}}, restablece tu contraseña aquí: {{link}}",
            ),
            ("es", "welcome", "Bienvenido a {{tenant}}", "Hola {{name}}, te damos la bienvenida."),
        ];
        let mut templates: BTreeMap<String, BTreeMap<String, EmailTemplate>> = BTreeMap::new();
        for (lang, name, subject, body) in entries {
            templates.entry(lang.to_string()).or_default().insert(
                name.to_string(),
                EmailTemplate {
                    subject: subject.to_string(),
                    body: body.to_string(),
                },
            );
        }
        Self { templates }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuerMode {
    #[default]
    Global,
    Path,
    Domain,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocialProvider {
    pub client_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_secret_enc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsentPolicy {
    /// Prompt for consent on first authorization of a client.
    pub require_consent: bool,
    /// Days a granted consent is remembered before prompting again; 0 keeps it.
    pub remember_days: u32,
}

impl Default for ConsentPolicy {
    fn default() -> Self {
        Self {
            require_consent: true,
            remember_days: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_secrets_are_not_serialized_once_cleared() {
        let mut settings = TenantSettings {
            smtp: Some(SmtpSettings {
                host: "smtp.example.com".into(),
                port: 587,
                password: "hunter2".into(),
                password_enc: "nonce|ct".into(),
                ..SmtpSettings::default()
            }),
            ..TenantSettings::default()
        };
        assert!(settings.has_plaintext());
        settings.clear_plaintext();
        assert!(!settings.has_plaintext());
        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(yaml.contains("passwordEnc: nonce|ct"));
        assert!(!yaml.contains("hunter2"));
        assert!(!yaml.contains("password:"));
    }

    #[test]
    fn default_templates_cover_both_languages() {
        let mailing = MailingSettings::defaults();
        for lang in ["en", "es"] {
            let templates = &mailing.templates[lang];
            for name in ["verify_email", "reset_password", "welcome"] {
                assert!(templates.contains_key(name), "{lang}/{name}");
            }
        }
    }

    #[test]
    fn sparse_settings_fill_defaults() {
        let settings: TenantSettings = serde_yaml::from_str("issuerMode: path\n").unwrap();
        assert_eq!(settings.issuer_mode, IssuerMode::Path);
        assert_eq!(settings.security, SecurityPolicy::default());
        assert!(settings.consent.require_consent);
    }
}
