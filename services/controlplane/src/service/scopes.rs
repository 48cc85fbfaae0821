//! Scope management, including the in-use rule on delete.
use super::validation::{unique_strings, valid_scope_name};
use super::{ControlPlaneService, ServiceError, ServiceResult};
use crate::cluster::Mutation;
use crate::model::{Scope, Tenant, is_system_scope};
use crate::store::StoreErrorKind;
use chrono::Utc;

fn normalize_scope(scope: &mut Scope) -> ServiceResult<()> {
    scope.name = scope.name.trim().to_string();
    if !valid_scope_name(&scope.name) {
        return Err(ServiceError::invalid("name", "not a valid scope name"));
    }
    scope.description = scope.description.trim().to_string();
    scope.claims = unique_strings(&scope.claims);
    scope.depends_on = unique_strings(&scope.depends_on);
    if scope.depends_on.contains(&scope.name) {
        return Err(ServiceError::invalid("dependsOn", "a scope cannot depend on itself"));
    }
    scope.system = false;
    Ok(())
}

impl ControlPlaneService {
    pub async fn list_scopes(&self, slug: &str) -> ServiceResult<Vec<Scope>> {
        self.require_tenant(slug).await?;
        Ok(self.dal.scopes()?.list(slug).await?)
    }

    pub async fn get_scope(&self, slug: &str, name: &str) -> ServiceResult<Scope> {
        self.require_tenant(slug).await?;
        Ok(self.dal.scopes()?.get(slug, name).await?)
    }

    pub async fn create_scope(&self, slug: &str, mut scope: Scope) -> ServiceResult<Scope> {
        self.require_tenant(slug).await?;
        normalize_scope(&mut scope)?;
        if is_system_scope(&scope.name) {
            return Err(ServiceError::SystemScope(scope.name));
        }
        let scopes = self.dal.scopes()?.list(slug).await?;
        if scopes.iter().any(|s| s.name == scope.name) {
            return Err(ServiceError::Conflict(format!("scope {} already exists", scope.name)));
        }
        if let Some(missing) = scope
            .depends_on
            .iter()
            .find(|dep| !scopes.iter().any(|s| &s.name == *dep))
        {
            return Err(ServiceError::invalid("dependsOn", format!("unknown scope {missing}")));
        }
        self.submit(Mutation::scope_create(slug, &scope, Utc::now())?)
            .await?;
        Ok(scope)
    }

    /// Replace the description, claims and dependencies of a custom scope.
    pub async fn update_scope(&self, slug: &str, mut scope: Scope) -> ServiceResult<Scope> {
        self.require_tenant(slug).await?;
        normalize_scope(&mut scope)?;
        if is_system_scope(&scope.name) {
            return Err(ServiceError::SystemScope(scope.name));
        }
        self.dal.scopes()?.get(slug, &scope.name).await?;
        self.submit(Mutation::scope_create(slug, &scope, Utc::now())?)
            .await?;
        Ok(scope)
    }

    /// Delete a custom scope. Refused for system scopes and for scopes that a
    /// client or an active consent still references.
    pub async fn delete_scope(&self, slug: &str, name: &str) -> ServiceResult<()> {
        let tenant = self.require_tenant(slug).await?;
        if is_system_scope(name) {
            return Err(ServiceError::SystemScope(name.to_string()));
        }
        self.dal.scopes()?.get(slug, name).await?;
        if self.scope_in_use(&tenant, name).await? {
            return Err(ServiceError::ScopeInUse(name.to_string()));
        }
        self.submit(Mutation::scope_delete(slug, name, Utc::now())?)
            .await?;
        Ok(())
    }

    async fn scope_in_use(&self, tenant: &Tenant, name: &str) -> ServiceResult<bool> {
        let clients = self.dal.clients()?.list(&tenant.slug).await?;
        if clients.iter().any(|c| c.uses_scope(name)) {
            return Ok(true);
        }
        // Tenants without a data plane have no consents to check.
        let consents = match self.dal.consents() {
            Ok(repo) => repo,
            Err(err) if err.kind() == StoreErrorKind::NotImplemented => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        match consents.scope_in_use(&tenant.id, name).await {
            Ok(in_use) => Ok(in_use),
            Err(err) if matches!(err.kind(), StoreErrorKind::NoDatabase | StoreErrorKind::NotImplemented) => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{ClientType, OidcClient, Scope};
    use crate::service::test_support::service;
    use crate::service::{CreateTenant, ServiceError};
    use std::collections::BTreeMap;

    fn custom(name: &str) -> Scope {
        Scope {
            name: name.into(),
            description: "Billing data".into(),
            display_name: None,
            claims: vec!["plan".into(), "plan".into()],
            depends_on: vec!["openid".into()],
            system: true,
        }
    }

    fn client(scopes: &[&str]) -> OidcClient {
        OidcClient {
            client_id: "web".into(),
            name: "Web".into(),
            client_type: ClientType::Public,
            redirect_uris: vec!["https://app.example.com/cb".into()],
            allowed_origins: Vec::new(),
            providers: Vec::new(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            secret: String::new(),
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
            name: "Acme".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();
        (dir, svc)
    }

    #[tokio::test]
    async fn referenced_scopes_cannot_be_deleted() {
        let (_dir, svc) = with_tenant().await;
        svc.create_client("acme", client(&["openid"])).await.unwrap();

        let err = svc.delete_scope("acme", "openid").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(svc.list_scopes("acme").await.unwrap().iter().any(|s| s.name == "openid"));

        svc.create_scope("acme", custom("billing")).await.unwrap();
        svc.update_client("acme", client(&["openid", "billing"])).await.unwrap();
        assert!(matches!(
            svc.delete_scope("acme", "billing").await,
            Err(ServiceError::ScopeInUse(name)) if name == "billing"
        ));

        svc.update_client("acme", client(&["openid"])).await.unwrap();
        svc.delete_scope("acme", "billing").await.unwrap();
        assert!(svc.get_scope("acme", "billing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn custom_scopes_are_normalized() {
        let (_dir, svc) = with_tenant().await;
        let created = svc.create_scope("acme", custom("billing")).await.unwrap();
        assert!(!created.system);
        assert_eq!(created.claims, vec!["plan"]);
        assert_eq!(svc.get_scope("acme", "billing").await.unwrap(), created);

        assert!(matches!(
            svc.create_scope("acme", custom("billing")).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.create_scope("acme", custom("profile")).await,
            Err(ServiceError::SystemScope(_))
        ));
        assert!(matches!(
            svc.create_scope("acme", custom("Bad Name")).await,
            Err(ServiceError::Invalid { field: "name", .. })
        ));
        let orphan = Scope {
            depends_on: vec!["missing".into()],
            ..custom("reports")
        };
        assert!(svc.create_scope("acme", orphan).await.is_err());

        let mut edited = created.clone();
        edited.description = "Plans and invoices".into();
        svc.update_scope("acme", edited).await.unwrap();
        assert_eq!(
            svc.get_scope("acme", "billing").await.unwrap().description,
            "Plans and invoices"
        );
    }

    #[tokio::test]
    async fn system_scopes_are_never_deleted() {
        let (_dir, svc) = with_tenant().await;
        assert!(matches!(
            svc.delete_scope("acme", "email").await,
            Err(ServiceError::SystemScope(_))
        ));
        assert!(svc.delete_scope("acme", "nope").await.unwrap_err().is_not_found());
    }
}
