//! OIDC client management.
use super::secrets::seal_client_secret;
use super::validation::{unique_strings, valid_client_id, valid_redirect_uri};
use super::{ControlPlaneService, ServiceError, ServiceResult};
use crate::cluster::{Mutation, MutationType};
use crate::model::OidcClient;
use chrono::Utc;
use idplane_crypto::secretbox;

impl ControlPlaneService {
    pub async fn list_clients(&self, slug: &str) -> ServiceResult<Vec<OidcClient>> {
        self.require_tenant(slug).await?;
        Ok(self.dal.clients()?.list(slug).await?)
    }

    pub async fn get_client(&self, slug: &str, client_id: &str) -> ServiceResult<OidcClient> {
        self.require_tenant(slug).await?;
        Ok(self.dal.clients()?.get(slug, client_id).await?)
    }

    /// Validate, normalize and seal a new client, then replicate it. The
    /// returned client carries only the sealed secret.
    pub async fn create_client(&self, slug: &str, mut client: OidcClient) -> ServiceResult<OidcClient> {
        self.require_tenant(slug).await?;
        client.secret_enc.clear();
        self.normalize_client(slug, &mut client).await?;
        match self.dal.clients()?.get(slug, &client.client_id).await {
            Ok(_) => {
                return Err(ServiceError::Conflict(format!(
                    "client {} already exists",
                    client.client_id
                )));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        seal_client_secret(&mut client)?;
        self.submit(Mutation::client_upsert(
            MutationType::ClientCreate,
            slug,
            &client,
            Utc::now(),
        )?)
        .await?;
        Ok(client)
    }

    /// Replace a client. An empty secret on a confidential client keeps the
    /// stored one; switching to public drops it.
    pub async fn update_client(&self, slug: &str, mut client: OidcClient) -> ServiceResult<OidcClient> {
        self.require_tenant(slug).await?;
        self.normalize_client(slug, &mut client).await?;
        let existing = self.dal.clients()?.get(slug, &client.client_id).await?;
        client.secret_enc = if client.is_confidential() {
            existing.secret_enc
        } else {
            String::new()
        };
        seal_client_secret(&mut client)?;
        self.submit(Mutation::client_upsert(
            MutationType::ClientUpdate,
            slug,
            &client,
            Utc::now(),
        )?)
        .await?;
        Ok(client)
    }

    pub async fn delete_client(&self, slug: &str, client_id: &str) -> ServiceResult<()> {
        self.require_tenant(slug).await?;
        self.dal.clients()?.get(slug, client_id).await?;
        self.submit(Mutation::client_delete(slug, client_id, Utc::now())?)
            .await?;
        Ok(())
    }

    /// Plaintext secret of a confidential client, read through the process
    /// master key.
    pub async fn decrypt_client_secret(&self, slug: &str, client_id: &str) -> ServiceResult<String> {
        let client = self.get_client(slug, client_id).await?;
        if client.secret_enc.is_empty() {
            return Err(ServiceError::NotFound(format!("client {client_id} has no secret")));
        }
        Ok(secretbox::decrypt(&client.secret_enc)?)
    }

    async fn normalize_client(&self, slug: &str, client: &mut OidcClient) -> ServiceResult<()> {
        client.client_id = client.client_id.trim().to_string();
        if !valid_client_id(&client.client_id) {
            return Err(ServiceError::invalid("clientId", "must match [a-z0-9_-]{3,64}"));
        }
        client.name = client.name.trim().to_string();
        if client.name.is_empty() {
            return Err(ServiceError::invalid("name", "must not be empty"));
        }

        client.redirect_uris = unique_strings(&client.redirect_uris);
        if let Some(bad) = client.redirect_uris.iter().find(|uri| !valid_redirect_uri(uri)) {
            return Err(ServiceError::invalid(
                "redirectUris",
                format!("{bad} must be https or a loopback http address"),
            ));
        }
        client.allowed_origins = unique_strings(&client.allowed_origins);
        client.providers = unique_strings(&client.providers);

        client.scopes = unique_strings(&client.scopes);
        let known = self.dal.scopes()?.list(slug).await?;
        if let Some(unknown) = client
            .scopes
            .iter()
            .find(|scope| !known.iter().any(|s| &s.name == *scope))
        {
            return Err(ServiceError::invalid("scopes", format!("unknown scope {unknown}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{ClientType, OidcClient};
    use crate::service::test_support::service;
    use crate::service::{CreateTenant, ServiceError};
    use std::collections::BTreeMap;

    fn web() -> OidcClient {
        OidcClient {
            client_id: "web".into(),
            name: "Web".into(),
            client_type: ClientType::Confidential,
            redirect_uris: vec!["http://localhost:3000/cb".into()],
            allowed_origins: Vec::new(),
            providers: Vec::new(),
            scopes: vec!["openid".into(), "profile".into()],
            secret: "s3cret".into(),
            secret_enc: String::new(),
            require_email_verification: false,
            reset_password_url: None,
            verify_email_url: None,
            claim_schema: None,
            claim_mapping: BTreeMap::new(),
        }
    }

    async fn with_tenant() -> (tempfile::TempDir, crate::service::ControlPlaneService) {
        let (dir, svc) = service();
        svc.create_tenant(CreateTenant {
            name: "Acme Inc".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();
        (dir, svc)
    }

    #[tokio::test]
    async fn confidential_client_secret_is_sealed_and_readable() {
        let (dir, svc) = with_tenant().await;
        svc.create_client("acme", web()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("tenants/acme/clients.yaml")).unwrap();
        assert!(raw.contains("secretEnc:"));
        assert!(!raw.contains("secret: "));
        assert!(!raw.contains("s3cret"));
        assert_eq!(svc.decrypt_client_secret("acme", "web").await.unwrap(), "s3cret");
    }

    #[tokio::test]
    async fn invalid_clients_are_refused() {
        let (_dir, svc) = with_tenant().await;
        let cases = [
            (OidcClient { client_id: "x".into(), ..web() }, "clientId"),
            (
                OidcClient {
                    redirect_uris: vec!["http://evil.example.com/cb".into()],
                    ..web()
                },
                "redirectUris",
            ),
            (OidcClient { scopes: vec!["admin".into()], ..web() }, "scopes"),
            (OidcClient { secret: String::new(), ..web() }, "secret"),
            (
                OidcClient {
                    client_type: ClientType::Public,
                    ..web()
                },
                "secret",
            ),
        ];
        for (client, expected) in cases {
            match svc.create_client("acme", client).await {
                Err(ServiceError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected invalid {expected}, got {other:?}"),
            }
        }
        assert!(svc.list_clients("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicates_conflict_and_updates_keep_the_secret() {
        let (_dir, svc) = with_tenant().await;
        svc.create_client("acme", web()).await.unwrap();
        assert!(matches!(
            svc.create_client("acme", web()).await,
            Err(ServiceError::Conflict(_))
        ));

        let renamed = OidcClient {
            name: "Web App".into(),
            secret: String::new(),
            redirect_uris: vec![
                "https://app.example.com/cb".into(),
                "https://app.example.com/cb".into(),
            ],
            ..web()
        };
        let updated = svc.update_client("acme", renamed).await.unwrap();
        assert_eq!(updated.redirect_uris.len(), 1);
        assert_eq!(svc.get_client("acme", "web").await.unwrap().name, "Web App");
        assert_eq!(svc.decrypt_client_secret("acme", "web").await.unwrap(), "s3cret");

        svc.delete_client("acme", "web").await.unwrap();
        assert!(svc.get_client("acme", "web").await.unwrap_err().is_not_found());
        assert!(svc.delete_client("acme", "web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_tenant_is_reported() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.create_client("ghost", web()).await,
            Err(ServiceError::TenantNotFound(_))
        ));
    }
}
