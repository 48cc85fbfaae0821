//! Tenant lifecycle and settings.
use super::secrets::seal_settings;
use super::validation::valid_slug;
use super::{ControlPlaneService, ServiceError, ServiceResult};
use crate::cluster::{Mutation, MutationType};
use crate::keys::GLOBAL_OWNER;
use crate::model::{ClaimsConfig, MailingSettings, Tenant, TenantSettings};
use chrono::Utc;

const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Default)]
pub struct CreateTenant {
    pub name: String,
    pub slug: String,
    pub language: Option<String>,
    pub settings: Option<TenantSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTenant {
    pub name: Option<String>,
    pub language: Option<String>,
}

fn check_slug(slug: &str) -> ServiceResult<()> {
    if !valid_slug(slug) {
        return Err(ServiceError::invalid("slug", "must match [a-z0-9-]+"));
    }
    if slug == GLOBAL_OWNER {
        return Err(ServiceError::invalid("slug", "is reserved"));
    }
    Ok(())
}

fn check_name(name: &str) -> ServiceResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::invalid("name", "must not be empty"));
    }
    Ok(name.to_string())
}

impl ControlPlaneService {
    pub async fn list_tenants(&self) -> ServiceResult<Vec<Tenant>> {
        Ok(self.dal.tenants()?.list().await?)
    }

    pub async fn get_tenant(&self, slug: &str) -> ServiceResult<Tenant> {
        self.require_tenant(slug).await
    }

    pub async fn get_tenant_by_id(&self, id: &str) -> ServiceResult<Tenant> {
        self.dal
            .tenants()?
            .get_by_id(id)
            .await
            .map_err(|err| ServiceError::tenant_lookup(id, err))
    }

    /// Create a tenant with default templates and sealed secrets. The store
    /// seeds the system scopes and the default claims configuration.
    pub async fn create_tenant(&self, input: CreateTenant) -> ServiceResult<Tenant> {
        check_slug(&input.slug)?;
        let name = check_name(&input.name)?;
        if self.dal.tenants()?.exists(&input.slug).await? {
            return Err(ServiceError::Conflict(format!("tenant {} already exists", input.slug)));
        }

        let mut settings = input.settings.unwrap_or_default();
        if settings.mailing.templates.is_empty() {
            settings.mailing = MailingSettings::defaults();
        }
        seal_settings(&mut settings)?;

        let now = Utc::now();
        let tenant = Tenant {
            id: uuid::Uuid::new_v4().to_string(),
            slug: input.slug,
            name,
            language: input
                .language
                .filter(|lang| !lang.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            settings,
            created_at: now,
            updated_at: now,
        };
        self.submit(Mutation::tenant_upsert(MutationType::TenantCreate, &tenant, now)?)
            .await?;
        tracing::info!(tenant = %tenant.slug, id = %tenant.id, "tenant created");
        Ok(tenant)
    }

    /// Rename a tenant or change its default language. Settings are left as
    /// stored.
    pub async fn update_tenant(&self, slug: &str, input: UpdateTenant) -> ServiceResult<Tenant> {
        let mut tenant = self.require_tenant(slug).await?;
        if let Some(name) = input.name {
            tenant.name = check_name(&name)?;
        }
        if let Some(language) = input.language {
            let language = language.trim();
            if language.is_empty() {
                return Err(ServiceError::invalid("language", "must not be empty"));
            }
            tenant.language = language.to_string();
        }
        let now = Utc::now();
        tenant.updated_at = now;
        self.submit(Mutation::tenant_upsert(MutationType::TenantUpdate, &tenant, now)?)
            .await?;
        tenant.settings.clear_plaintext();
        Ok(tenant)
    }

    /// Replace a tenant's settings. Plaintext secrets in `settings` are sealed;
    /// cached pools and cache clients for the tenant are dropped afterwards.
    pub async fn update_settings(
        &self,
        slug: &str,
        mut settings: TenantSettings,
    ) -> ServiceResult<TenantSettings> {
        self.require_tenant(slug).await?;
        seal_settings(&mut settings)?;
        self.submit(Mutation::settings_update(slug, &settings, Utc::now())?)
            .await?;
        self.evict_tenant(slug).await;
        Ok(settings)
    }

    pub async fn delete_tenant(&self, slug: &str) -> ServiceResult<()> {
        self.require_tenant(slug).await?;
        self.submit(Mutation::tenant_delete(slug, Utc::now())?).await?;
        self.evict_tenant(slug).await;
        tracing::info!(tenant = slug, "tenant deleted");
        Ok(())
    }

    pub async fn get_claims(&self, slug: &str) -> ServiceResult<ClaimsConfig> {
        self.require_tenant(slug).await?;
        Ok(self.dal.claims()?.get(slug).await?)
    }

    /// Claims configuration is not part of the replicated mutation set, so it
    /// can only be written on a single-node deployment.
    pub async fn put_claims(&self, slug: &str, claims: &ClaimsConfig) -> ServiceResult<()> {
        if self.cluster.is_clustered() {
            return Err(ServiceError::Unsupported(
                "claims configuration is not replicated".into(),
            ));
        }
        self.require_tenant(slug).await?;
        let mut seen = Vec::with_capacity(claims.custom.len());
        for claim in &claims.custom {
            if claim.name.trim().is_empty() || claim.source.trim().is_empty() {
                return Err(ServiceError::invalid("custom", "claims need a name and a source"));
            }
            if seen.contains(&claim.name.as_str()) {
                return Err(ServiceError::invalid("custom", format!("duplicate claim {}", claim.name)));
            }
            seen.push(claim.name.as_str());
        }
        self.dal.claims()?.put(slug, claims).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CustomClaim, UserDbSettings};
    use crate::service::test_support::service;
    use idplane_crypto::secretbox;

    fn acme() -> CreateTenant {
        CreateTenant {
            name: "Acme Inc".into(),
            slug: "acme".into(),
            language: Some("en".into()),
            settings: None,
        }
    }

    #[tokio::test]
    async fn create_writes_tenant_yaml_with_templates() {
        let (dir, svc) = service();
        let tenant = svc.create_tenant(acme()).await.unwrap();
        assert_eq!(tenant.slug, "acme");

        let raw = std::fs::read_to_string(dir.path().join("tenants/acme/tenant.yaml")).unwrap();
        assert!(raw.contains("name: Acme Inc"));
        assert!(raw.contains("slug: acme"));
        let stored: Tenant = serde_yaml::from_str(&raw).unwrap();
        assert!(!stored.settings.mailing.templates.is_empty());

        let all = svc.list_tenants().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(svc.get_tenant_by_id(&tenant.id).await.unwrap().slug, "acme");
        // System scopes are seeded.
        assert_eq!(svc.list_scopes("acme").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn slug_rules_and_duplicates() {
        let (_dir, svc) = service();
        let bad = CreateTenant {
            slug: "Acme!".into(),
            ..acme()
        };
        assert!(matches!(
            svc.create_tenant(bad).await,
            Err(ServiceError::Invalid { field: "slug", .. })
        ));
        let reserved = CreateTenant {
            slug: "global".into(),
            ..acme()
        };
        assert!(svc.create_tenant(reserved).await.is_err());
        let unnamed = CreateTenant {
            name: "  ".into(),
            ..acme()
        };
        assert!(matches!(
            svc.create_tenant(unnamed).await,
            Err(ServiceError::Invalid { field: "name", .. })
        ));

        svc.create_tenant(acme()).await.unwrap();
        assert!(matches!(
            svc.create_tenant(acme()).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn settings_secrets_are_sealed_on_disk() {
        let (dir, svc) = service();
        let input = CreateTenant {
            settings: Some(TenantSettings {
                user_db: Some(UserDbSettings {
                    driver: "postgres".into(),
                    dsn: "postgres://u:p@db/acme".into(),
                    ..UserDbSettings::default()
                }),
                ..TenantSettings::default()
            }),
            ..acme()
        };
        svc.create_tenant(input).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("tenants/acme/tenant.yaml")).unwrap();
        assert!(!raw.contains("u:p@db"));

        let read = svc.get_tenant("acme").await.unwrap();
        let db = read.settings.user_db.unwrap();
        assert_eq!(secretbox::decrypt(&db.dsn_enc).unwrap(), "postgres://u:p@db/acme");
    }

    #[tokio::test]
    async fn update_and_delete() {
        let (dir, svc) = service();
        svc.create_tenant(acme()).await.unwrap();
        let updated = svc
            .update_tenant(
                "acme",
                UpdateTenant {
                    name: Some("Acme Corp".into()),
                    language: Some("es".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Acme Corp");
        let read = svc.get_tenant("acme").await.unwrap();
        assert_eq!(read.language, "es");

        let mut settings = read.settings.clone();
        settings.session_ttl_secs = 600;
        svc.update_settings("acme", settings).await.unwrap();
        assert_eq!(svc.get_tenant("acme").await.unwrap().settings.session_ttl_secs, 600);

        svc.delete_tenant("acme").await.unwrap();
        assert!(!dir.path().join("tenants/acme").exists());
        assert!(matches!(
            svc.get_tenant("acme").await,
            Err(ServiceError::TenantNotFound(slug)) if slug == "acme"
        ));
        assert!(svc.delete_tenant("acme").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn claims_are_local_writes() {
        let (_dir, svc) = service();
        svc.create_tenant(acme()).await.unwrap();
        let mut claims = svc.get_claims("acme").await.unwrap();
        assert!(claims.standard.contains(&"email".to_string()));
        claims.custom.push(CustomClaim {
            name: "department".into(),
            description: String::new(),
            source: "user.department".into(),
            scopes: vec!["profile".into()],
        });
        svc.put_claims("acme", &claims).await.unwrap();
        assert_eq!(svc.get_claims("acme").await.unwrap().custom.len(), 1);

        claims.custom.push(claims.custom[0].clone());
        assert!(svc.put_claims("acme", &claims).await.is_err());
    }
}
