//! User consent grants. Consents live in the tenant's data plane and are not
//! replicated through the log.
use super::validation::unique_strings;
use super::{ControlPlaneService, ServiceError, ServiceResult};
use crate::model::Consent;
use chrono::Utc;

impl ControlPlaneService {
    /// Grant `scopes` of `client_id` to a user, merging with any earlier grant.
    pub async fn grant_consent(
        &self,
        slug: &str,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
    ) -> ServiceResult<Consent> {
        let tenant = self.require_tenant(slug).await?;
        let client = self.dal.clients()?.get(slug, client_id).await?;
        let scopes = unique_strings(scopes);
        if scopes.is_empty() {
            return Err(ServiceError::invalid("scopes", "at least one scope is required"));
        }
        if let Some(extra) = scopes.iter().find(|s| !client.uses_scope(s)) {
            return Err(ServiceError::invalid(
                "scopes",
                format!("client {client_id} does not request {extra}"),
            ));
        }
        let now = Utc::now();
        let consent = Consent {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.id,
            user_id: user_id.to_string(),
            client_id: client.client_id,
            scopes,
            granted_at: now,
            updated_at: now,
            revoked_at: None,
        };
        Ok(self.dal.consents()?.upsert(&consent).await?)
    }

    /// Revoke a consent together with the user's refresh tokens for the client.
    pub async fn revoke_consent(&self, slug: &str, user_id: &str, client_id: &str) -> ServiceResult<()> {
        let tenant = self.require_tenant(slug).await?;
        self.dal
            .consents()?
            .revoke(&tenant.id, user_id, client_id, Utc::now())
            .await?;
        Ok(())
    }

    pub async fn list_consents(&self, slug: &str, user_id: &str) -> ServiceResult<Vec<Consent>> {
        let tenant = self.require_tenant(slug).await?;
        Ok(self.dal.consents()?.list_by_user(&tenant.id, user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::service::test_support::service;
    use crate::service::{CreateTenant, ServiceError};

    #[tokio::test]
    async fn consents_need_a_data_plane() {
        let (_dir, svc) = service();
        svc.create_tenant(CreateTenant {
            name: "Acme".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();
        assert!(matches!(
            svc.list_consents("acme", "u1").await,
            Err(ServiceError::NoDatabase(_))
        ));
        assert!(svc.grant_consent("acme", "u1", "web", &["openid".into()]).await.unwrap_err().is_not_found());
        assert!(matches!(
            svc.revoke_consent("ghost", "u1", "web").await,
            Err(ServiceError::TenantNotFound(_))
        ));
    }
}
