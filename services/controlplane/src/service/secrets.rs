//! Sealing of secrets before they leave the service layer.
//!
//! Plaintext secret fields are input only: each non-empty one is encrypted
//! into its `*Enc` counterpart and then cleared. Callers seal on the leader,
//! before a mutation is built, so followers only ever see ciphertext.
use super::error::{ServiceError, ServiceResult};
use crate::model::{OidcClient, TenantSettings};
use idplane_crypto::secretbox;

fn seal(plaintext: &mut String, sealed: &mut String) -> ServiceResult<()> {
    if plaintext.is_empty() {
        return Ok(());
    }
    *sealed = secretbox::encrypt(plaintext)?;
    plaintext.clear();
    Ok(())
}

/// Encrypt SMTP password, user DB DSN, cache password and social-provider
/// client secrets.
pub fn seal_settings(settings: &mut TenantSettings) -> ServiceResult<()> {
    if let Some(smtp) = settings.smtp.as_mut() {
        seal(&mut smtp.password, &mut smtp.password_enc)?;
    }
    if let Some(db) = settings.user_db.as_mut() {
        seal(&mut db.dsn, &mut db.dsn_enc)?;
    }
    if let Some(cache) = settings.cache.as_mut() {
        seal(&mut cache.password, &mut cache.password_enc)?;
    }
    for provider in settings.social.values_mut() {
        seal(&mut provider.client_secret, &mut provider.client_secret_enc)?;
    }
    Ok(())
}

/// Enforce the secret rules for the client type and seal the secret.
///
/// Confidential clients need a secret, either new plaintext or an existing
/// `secret_enc`; public clients must not carry one.
pub fn seal_client_secret(client: &mut OidcClient) -> ServiceResult<()> {
    if client.is_confidential() {
        if client.secret.is_empty() && client.secret_enc.is_empty() {
            return Err(ServiceError::invalid(
                "secret",
                "confidential clients require a secret",
            ));
        }
        seal(&mut client.secret, &mut client.secret_enc)
    } else {
        if !client.secret.is_empty() || !client.secret_enc.is_empty() {
            return Err(ServiceError::invalid("secret", "public clients must not have a secret"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientType, SmtpSettings, SocialProvider, UserDbSettings};
    use crate::store::fs::test_support::init_secretbox;
    use std::collections::BTreeMap;

    fn client(client_type: ClientType, secret: &str) -> OidcClient {
        OidcClient {
            client_id: "web".into(),
            name: "Web".into(),
            client_type,
            redirect_uris: Vec::new(),
            allowed_origins: Vec::new(),
            providers: Vec::new(),
            scopes: Vec::new(),
            secret: secret.into(),
            secret_enc: String::new(),
            require_email_verification: false,
            reset_password_url: None,
            verify_email_url: None,
            claim_schema: None,
            claim_mapping: BTreeMap::new(),
        }
    }

    #[test]
    fn settings_secrets_are_sealed_and_cleared() {
        init_secretbox();
        let mut settings = TenantSettings {
            smtp: Some(SmtpSettings {
                password: "smtp-pass".into(),
                ..SmtpSettings::default()
            }),
            user_db: Some(UserDbSettings {
                driver: "postgres".into(),
                dsn: "postgres://u:p@db/acme".into(),
                ..UserDbSettings::default()
            }),
            ..TenantSettings::default()
        };
        settings.social.insert(
            "google".into(),
            SocialProvider {
                client_id: "g-id".into(),
                client_secret: "g-secret".into(),
                client_secret_enc: String::new(),
            },
        );
        seal_settings(&mut settings).unwrap();
        assert!(!settings.has_plaintext());
        let db = settings.user_db.as_ref().unwrap();
        assert_eq!(secretbox::decrypt(&db.dsn_enc).unwrap(), "postgres://u:p@db/acme");
        assert_eq!(
            secretbox::decrypt(&settings.social["google"].client_secret_enc).unwrap(),
            "g-secret"
        );
    }

    #[test]
    fn client_secret_rules_follow_the_type() {
        init_secretbox();
        let mut confidential = client(ClientType::Confidential, "s3cret");
        seal_client_secret(&mut confidential).unwrap();
        assert!(confidential.secret.is_empty());
        assert_eq!(secretbox::decrypt(&confidential.secret_enc).unwrap(), "s3cret");

        // Updating without a new secret keeps the sealed one.
        seal_client_secret(&mut confidential).unwrap();

        let mut missing = client(ClientType::Confidential, "");
        assert!(matches!(
            seal_client_secret(&mut missing),
            Err(ServiceError::Invalid { field: "secret", .. })
        ));

        let mut public = client(ClientType::Public, "oops");
        assert!(seal_client_secret(&mut public).is_err());
        let mut public = client(ClientType::Public, "");
        seal_client_secret(&mut public).unwrap();
    }
}
