use super::{
    CLAIMS_FILE, CLIENTS_FILE, FsStore, SCOPES_FILE, TENANT_FILE, TENANTS_DIR, read_yaml,
    write_yaml,
};
use crate::model::{ClaimsConfig, OidcClient, Scope, Tenant, TenantSettings};
use crate::store::{ClaimsRepository, StoreError, StoreResult, TenantRepository};
use async_trait::async_trait;
use idplane_crypto::secretbox;
use std::fs;

/// Decrypt `*Enc` fields into their plaintext counterparts. Best effort: a
/// missing master key or a bad ciphertext leaves the plaintext empty.
fn reveal_secrets(settings: &mut TenantSettings) {
    if !secretbox::is_initialized() {
        return;
    }
    let open = |field: &str, sealed: &str| -> String {
        if sealed.is_empty() {
            return String::new();
        }
        secretbox::decrypt(sealed).unwrap_or_else(|err| {
            tracing::warn!(field, error = %err, "failed to decrypt tenant secret");
            String::new()
        })
    };
    if let Some(smtp) = settings.smtp.as_mut() {
        smtp.password = open("smtp.password", &smtp.password_enc);
    }
    if let Some(db) = settings.user_db.as_mut() {
        db.dsn = open("userDb.dsn", &db.dsn_enc);
    }
    if let Some(cache) = settings.cache.as_mut() {
        cache.password = open("cache.password", &cache.password_enc);
    }
    for provider in settings.social.values_mut() {
        provider.client_secret = open("social.clientSecret", &provider.client_secret_enc);
    }
}

impl FsStore {
    fn load_tenant(&self, slug: &str) -> StoreResult<Tenant> {
        let dir = self.tenant_dir(slug)?;
        let mut tenant: Tenant = read_yaml(&dir.join(TENANT_FILE))?
            .ok_or_else(|| StoreError::NotFound(format!("tenant {slug}")))?;
        reveal_secrets(&mut tenant.settings);
        Ok(tenant)
    }

    fn store_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        let dir = self.tenant_dir(&tenant.slug)?;
        let mut persisted = tenant.clone();
        persisted.settings.clear_plaintext();
        write_yaml(&dir.join(TENANT_FILE), &persisted)
    }

    /// Valid tenants sorted by slug; hidden and unreadable entries are skipped.
    fn scan_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.root.join(TENANTS_DIR))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(slug) = name.to_str() else {
                continue;
            };
            if slug.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            match self.load_tenant(slug) {
                Ok(tenant) => out.push(tenant),
                Err(err) => tracing::debug!(slug, error = %err, "skipping unreadable tenant"),
            }
        }
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }
}

#[async_trait]
impl TenantRepository for FsStore {
    async fn list(&self) -> StoreResult<Vec<Tenant>> {
        let _guard = self.read_guard();
        self.scan_tenants()
    }

    async fn get_by_slug(&self, slug: &str) -> StoreResult<Tenant> {
        let _guard = self.read_guard();
        self.load_tenant(slug)
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Tenant> {
        let _guard = self.read_guard();
        self.scan_tenants()?
            .into_iter()
            .find(|tenant| tenant.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant id {id}")))
    }

    async fn create(&self, tenant: &Tenant) -> StoreResult<()> {
        let _guard = self.write_guard();
        let dir = self.tenant_dir(&tenant.slug)?;
        if dir.join(TENANT_FILE).exists() {
            return Err(StoreError::Conflict(format!("tenant {} already exists", tenant.slug)));
        }
        fs::create_dir_all(&dir)?;
        self.store_tenant(tenant)?;
        if !dir.join(SCOPES_FILE).exists() {
            write_yaml(&dir.join(SCOPES_FILE), &Scope::system_defaults())?;
        }
        if !dir.join(CLAIMS_FILE).exists() {
            write_yaml(&dir.join(CLAIMS_FILE), &ClaimsConfig::default())?;
        }
        if !dir.join(CLIENTS_FILE).exists() {
            write_yaml(&dir.join(CLIENTS_FILE), &Vec::<OidcClient>::new())?;
        }
        tracing::debug!(slug = %tenant.slug, "tenant created");
        Ok(())
    }

    async fn update(&self, tenant: &Tenant) -> StoreResult<()> {
        let _guard = self.write_guard();
        self.existing_tenant_dir(&tenant.slug)?;
        self.store_tenant(tenant)
    }

    async fn delete(&self, slug: &str) -> StoreResult<()> {
        let _guard = self.write_guard();
        let dir = self.tenant_dir(slug)?;
        if !dir.exists() {
            return Err(StoreError::NotFound(format!("tenant {slug}")));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    async fn exists(&self, slug: &str) -> StoreResult<bool> {
        let _guard = self.read_guard();
        Ok(self.tenant_dir(slug)?.join(TENANT_FILE).is_file())
    }
}

#[async_trait]
impl ClaimsRepository for FsStore {
    async fn get(&self, tenant: &str) -> StoreResult<ClaimsConfig> {
        let _guard = self.read_guard();
        let dir = self.existing_tenant_dir(tenant)?;
        Ok(read_yaml(&dir.join(CLAIMS_FILE))?.unwrap_or_default())
    }

    async fn put(&self, tenant: &str, claims: &ClaimsConfig) -> StoreResult<()> {
        let _guard = self.write_guard();
        let dir = self.existing_tenant_dir(tenant)?;
        write_yaml(&dir.join(CLAIMS_FILE), claims)
    }
}
