//! User consents for a client's scopes.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consent {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub granted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Consent {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    /// Upsert rule: union the scopes in first-seen order and clear revocation.
    pub fn merge_grant(&mut self, scopes: &[String], now: DateTime<Utc>) {
        for scope in scopes {
            if !self.scopes.contains(scope) {
                self.scopes.push(scope.clone());
            }
        }
        self.revoked_at = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_scopes_and_clears_revocation() {
        let then = Utc::now() - chrono::Duration::days(1);
        let mut consent = Consent {
            id: "c1".into(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            client_id: "web".into(),
            scopes: vec!["openid".into(), "email".into()],
            granted_at: then,
            updated_at: then,
            revoked_at: Some(then),
        };
        let now = Utc::now();
        consent.merge_grant(&["email".into(), "profile".into()], now);
        assert_eq!(consent.scopes, vec!["openid", "email", "profile"]);
        assert!(consent.is_active());
        assert_eq!(consent.updated_at, now);
        assert_eq!(consent.granted_at, then);
    }
}
