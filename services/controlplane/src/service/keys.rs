//! Signing-key operations.
//!
//! Rotation material is generated here, on the leader, and replicated as a
//! `key.rotate` mutation; every node then stores the same bytes. Revocation
//! is an emergency, node-local operation.
use super::{ControlPlaneService, ServiceResult};
use crate::cluster::Mutation;
use crate::keys::{
    GLOBAL_OWNER, Jwks, KeyError, KeyStatus, RotationPayload, SigningAlgorithm, StoredKey,
};
use chrono::Utc;
use std::sync::Arc;

impl ControlPlaneService {
    async fn require_owner(&self, owner: &str) -> ServiceResult<()> {
        if owner != GLOBAL_OWNER {
            self.require_tenant(owner).await?;
        }
        Ok(())
    }

    /// Rotate `owner`'s signing key (a tenant slug or `global`). The key that
    /// was serving `owner` stays in the JWKS for `grace` seconds, or the
    /// configured window when `None`. Returns the new active key.
    pub async fn rotate_signing_key(
        &self,
        owner: &str,
        grace: Option<u64>,
    ) -> ServiceResult<StoredKey> {
        self.require_owner(owner).await?;
        let grace = grace.unwrap_or(self.rotation_grace_secs);
        let keys = self.dal.keys()?;
        let payload = keys.prepare_rotation(owner, grace, Utc::now())?;
        let active: StoredKey = serde_json::from_str(&payload.active_json).map_err(KeyError::from)?;
        self.submit(Mutation::key_rotate(owner, &payload, Utc::now())?)
            .await?;
        tracing::info!(owner, kid = %active.kid, "signing key rotation replicated");
        Ok(active)
    }

    /// Public keys for `owner`, served from the JWKS cache.
    pub async fn jwks(&self, owner: &str) -> ServiceResult<Arc<Jwks>> {
        self.require_owner(owner).await?;
        let keys = self.dal.keys()?;
        Ok(self.jwks.get_or_load(owner, || keys.jwks(owner))?)
    }

    /// Kid of the key currently signing for `owner`, after the global
    /// fallback.
    pub async fn active_kid(&self, owner: &str) -> ServiceResult<String> {
        self.require_owner(owner).await?;
        Ok(self.dal.keys()?.get_active(owner)?.kid)
    }

    /// Delete the key file carrying `kid` on this node and drop cached JWKS.
    pub async fn revoke_signing_key(&self, kid: &str) -> ServiceResult<()> {
        self.dal.keys()?.revoke(kid)?;
        self.jwks.invalidate_all();
        Ok(())
    }

    /// Make sure a global active key exists. Only the leader generates one;
    /// followers receive it through the log. Returns the active kid, if any.
    pub async fn bootstrap_signing_key(&self) -> ServiceResult<Option<String>> {
        let keys = self.dal.keys()?;
        if let Some(existing) = keys.load(GLOBAL_OWNER, KeyStatus::Active)? {
            return Ok(Some(existing.kid));
        }
        if !self.cluster.is_leader() {
            return Ok(None);
        }
        let now = Utc::now();
        let key = StoredKey::generate(keys.master_key()?, GLOBAL_OWNER, SigningAlgorithm::default(), now)?;
        let payload = RotationPayload {
            active_json: serde_json::to_string_pretty(&key).map_err(KeyError::from)?,
            retiring_json: None,
            grace_seconds: None,
        };
        self.submit(Mutation::key_rotate(GLOBAL_OWNER, &payload, now)?)
            .await?;
        tracing::info!(kid = %key.kid, "global signing key bootstrapped");
        Ok(Some(key.kid))
    }
}

#[cfg(test)]
mod tests {
    use crate::keys::{GLOBAL_OWNER, KeyStatus};
    use crate::service::test_support::service;
    use crate::service::{CreateTenant, ServiceError};

    #[tokio::test]
    async fn rotation_keeps_the_previous_key_published() {
        let (dir, svc) = service();
        svc.create_tenant(CreateTenant {
            name: "Acme".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();

        let first = svc.rotate_signing_key("acme", None).await.unwrap();
        assert!(dir.path().join("keys/acme/active.json").is_file());
        assert!(dir.path().join("keys/acme/retiring.json").is_file());
        assert_eq!(svc.active_kid("acme").await.unwrap(), first.kid);

        let jwks = svc.jwks("acme").await.unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert!(jwks.kids().contains(&first.kid.as_str()));

        let second = svc.rotate_signing_key("acme", None).await.unwrap();
        assert_ne!(first.kid, second.kid);
        // The cache was invalidated by the applier.
        let jwks = svc.jwks("acme").await.unwrap();
        let kids = jwks.kids();
        assert!(kids.contains(&second.kid.as_str()));
        assert!(kids.contains(&first.kid.as_str()));
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent_and_tenants_fall_back() {
        let (_dir, svc) = service();
        let kid = svc.bootstrap_signing_key().await.unwrap().unwrap();
        assert_eq!(svc.bootstrap_signing_key().await.unwrap(), Some(kid.clone()));
        assert_eq!(svc.active_kid(GLOBAL_OWNER).await.unwrap(), kid);

        svc.create_tenant(CreateTenant {
            name: "Globex".into(),
            slug: "globex".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();
        assert_eq!(svc.active_kid("globex").await.unwrap(), kid);
        assert_eq!(svc.jwks("globex").await.unwrap().kids(), vec![kid.as_str()]);
    }

    #[tokio::test]
    async fn rotation_honours_the_requested_grace() {
        let (_dir, svc) = service();
        let global = svc.bootstrap_signing_key().await.unwrap().unwrap();
        svc.create_tenant(CreateTenant {
            name: "Acme".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();

        let next = svc.rotate_signing_key("acme", Some(60)).await.unwrap();
        assert_eq!(svc.active_kid("acme").await.unwrap(), next.kid);
        let jwks = svc.jwks("acme").await.unwrap();
        assert_eq!(jwks.kids(), vec![next.kid.as_str(), global.as_str()]);
        let retiring = &jwks.keys[1];
        let retired = svc
            .dal()
            .keys()
            .unwrap()
            .load("acme", KeyStatus::Retiring)
            .unwrap()
            .unwrap();
        assert_eq!(retired.grace_seconds, Some(60));
        assert_eq!(retiring.exp, retired.expires_at.map(|at| at.timestamp()));

        assert!(matches!(
            svc.rotate_signing_key("acme", Some(u64::MAX)).await,
            Err(ServiceError::Invalid { field: "grace", .. })
        ));
    }

    #[tokio::test]
    async fn revoke_removes_the_key_everywhere() {
        let (_dir, svc) = service();
        let kid = svc.bootstrap_signing_key().await.unwrap().unwrap();
        assert_eq!(svc.jwks(GLOBAL_OWNER).await.unwrap().keys.len(), 1);
        svc.revoke_signing_key(&kid).await.unwrap();
        assert!(svc.jwks(GLOBAL_OWNER).await.unwrap().keys.is_empty());
        assert!(svc.revoke_signing_key(&kid).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unknown_owners_are_refused() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.rotate_signing_key("ghost", None).await,
            Err(ServiceError::TenantNotFound(_))
        ));
    }
}
