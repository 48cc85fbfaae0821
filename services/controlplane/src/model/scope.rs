//! Scopes and the per-tenant claims configuration.
use serde::{Deserialize, Serialize};

/// Scopes seeded into every tenant; they cannot be deleted.
pub const SYSTEM_SCOPES: [&str; 6] = ["openid", "email", "profile", "offline_access", "phone", "address"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claims: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub system: bool,
}

impl Scope {
    /// The built-in scope set with the standard OIDC claims attached.
    pub fn system_defaults() -> Vec<Scope> {
        let spec: [(&str, &str, &[&str]); 6] = [
            ("openid", "OpenID Connect sign-in", &["sub"]),
            ("email", "Email address", &["email", "email_verified"]),
            (
                "profile",
                "Basic profile",
                &["name", "given_name", "family_name", "picture", "locale"],
            ),
            ("offline_access", "Refresh tokens", &[]),
            ("phone", "Phone number", &["phone_number", "phone_number_verified"]),
            ("address", "Postal address", &["address"]),
        ];
        spec.iter()
            .map(|(name, description, claims)| Scope {
                name: name.to_string(),
                description: description.to_string(),
                display_name: None,
                claims: claims.iter().map(|c| c.to_string()).collect(),
                depends_on: if *name == "offline_access" {
                    vec!["openid".to_string()]
                } else {
                    Vec::new()
                },
                system: true,
            })
            .collect()
    }
}

pub fn is_system_scope(name: &str) -> bool {
    SYSTEM_SCOPES.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsConfig {
    #[serde(default)]
    pub standard: Vec<String>,
    #[serde(default)]
    pub custom: Vec<CustomClaim>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomClaim {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// User field or expression the value is read from.
    pub source: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        let standard = Scope::system_defaults()
            .into_iter()
            .flat_map(|scope| scope.claims)
            .collect();
        Self {
            standard,
            custom: Vec::new(),
        }
    }
}
