use super::{CLIENTS_FILE, FsStore, read_list, write_yaml};
use crate::model::OidcClient;
use crate::store::{ClientRepository, StoreError, StoreResult};
use async_trait::async_trait;

fn persisted(client: &OidcClient) -> OidcClient {
    let mut client = client.clone();
    client.secret.clear();
    client
}

#[async_trait]
impl ClientRepository for FsStore {
    async fn list(&self, tenant: &str) -> StoreResult<Vec<OidcClient>> {
        let _guard = self.read_guard();
        let dir = self.existing_tenant_dir(tenant)?;
        read_list(&dir.join(CLIENTS_FILE))
    }

    async fn get(&self, tenant: &str, client_id: &str) -> StoreResult<OidcClient> {
        let _guard = self.read_guard();
        let dir = self.existing_tenant_dir(tenant)?;
        read_list::<OidcClient>(&dir.join(CLIENTS_FILE))?
            .into_iter()
            .find(|c| c.client_id == client_id)
            .ok_or_else(|| StoreError::NotFound(format!("client {client_id} in tenant {tenant}")))
    }

    async fn create(&self, tenant: &str, client: &OidcClient) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.existing_tenant_dir(tenant)?.join(CLIENTS_FILE);
        let mut clients: Vec<OidcClient> = read_list(&path)?;
        if clients.iter().any(|c| c.client_id == client.client_id) {
            return Err(StoreError::Conflict(format!(
                "client {} already exists in tenant {tenant}",
                client.client_id
            )));
        }
        clients.push(persisted(client));
        write_yaml(&path, &clients)
    }

    async fn update(&self, tenant: &str, client: &OidcClient) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.existing_tenant_dir(tenant)?.join(CLIENTS_FILE);
        let mut clients: Vec<OidcClient> = read_list(&path)?;
        let slot = clients
            .iter_mut()
            .find(|c| c.client_id == client.client_id)
            .ok_or_else(|| {
                StoreError::NotFound(format!("client {} in tenant {tenant}", client.client_id))
            })?;
        *slot = persisted(client);
        write_yaml(&path, &clients)
    }

    async fn delete(&self, tenant: &str, client_id: &str) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.existing_tenant_dir(tenant)?.join(CLIENTS_FILE);
        let mut clients: Vec<OidcClient> = read_list(&path)?;
        let before = clients.len();
        clients.retain(|c| c.client_id != client_id);
        if clients.len() == before {
            return Err(StoreError::NotFound(format!("client {client_id} in tenant {tenant}")));
        }
        write_yaml(&path, &clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientType, Tenant, TenantSettings};
    use crate::store::TenantRepository;
    use crate::store::fs::test_support::temp_store;
    use chrono::Utc;

    fn client(id: &str) -> OidcClient {
        OidcClient {
            client_id: id.to_string(),
            name: "Web".to_string(),
            client_type: ClientType::Confidential,
            redirect_uris: vec!["http://localhost:3000/cb".into()],
            allowed_origins: Vec::new(),
            providers: Vec::new(),
            scopes: vec!["openid".into()],
            secret: "plaintext".into(),
            secret_enc: "nonce|ct".into(),
            require_email_verification: false,
            reset_password_url: None,
            verify_email_url: None,
            claim_schema: None,
            claim_mapping: Default::default(),
        }
    }

    async fn seeded() -> (tempfile::TempDir, std::sync::Arc<FsStore>) {
        let (dir, store) = temp_store();
        let now = Utc::now();
        let tenant = Tenant {
            id: "t1".into(),
            slug: "acme".into(),
            name: "Acme".into(),
            language: "en".into(),
            settings: TenantSettings::default(),
            created_at: now,
            updated_at: now,
        };
        TenantRepository::create(store.as_ref(), &tenant).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_strips_plaintext_and_detects_duplicates() {
        let (dir, store) = seeded().await;
        ClientRepository::create(store.as_ref(), "acme", &client("web")).await.unwrap();
        let yaml = std::fs::read_to_string(dir.path().join("tenants/acme/clients.yaml")).unwrap();
        assert!(yaml.contains("secretEnc: nonce|ct"));
        assert!(!yaml.contains("plaintext"));

        let err = ClientRepository::create(store.as_ref(), "acme", &client("web"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_and_delete_require_existing_client() {
        let (_dir, store) = seeded().await;
        let mut c = client("web");
        assert!(ClientRepository::update(store.as_ref(), "acme", &c)
            .await
            .unwrap_err()
            .is_not_found());
        ClientRepository::create(store.as_ref(), "acme", &c).await.unwrap();
        c.name = "Web v2".into();
        ClientRepository::update(store.as_ref(), "acme", &c).await.unwrap();
        let loaded = ClientRepository::get(store.as_ref(), "acme", "web").await.unwrap();
        assert_eq!(loaded.name, "Web v2");
        assert!(loaded.secret.is_empty());

        ClientRepository::delete(store.as_ref(), "acme", "web").await.unwrap();
        assert!(ClientRepository::delete(store.as_ref(), "acme", "web")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let (_dir, store) = temp_store();
        let err = ClientRepository::list(store.as_ref(), "ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
