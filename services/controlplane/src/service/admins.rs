//! Control-plane administrators.
//!
//! # Purpose
//! CRUD over admin accounts, password authentication through an injected
//! [`PasswordVerifier`], opaque refresh tokens stored by hash, and the
//! tenant access check.
//!
//! # Key invariants
//! - Refresh tokens are returned once; only their SHA-256 is stored.
//! - Refreshing revokes the presented token before issuing the next one.
//! - Unknown accounts, disabled accounts and wrong passwords all fail the
//!   same way.
use super::validation::{normalize_email, unique_strings, valid_slug};
use super::{ControlPlaneService, ServiceError, ServiceResult};
use crate::model::{Admin, AdminRefreshToken, AdminType, generate_token, hash_token};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Password hashing primitive supplied by the embedding application.
pub trait PasswordVerifier: Send + Sync {
    fn hash(&self, password: &str) -> ServiceResult<String>;
    fn verify(&self, password: &str, hash: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct CreateAdmin {
    pub email: String,
    pub name: String,
    pub password: String,
    pub admin_type: AdminType,
    pub assigned_tenants: Vec<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAdmin {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub assigned_tenants: Option<Vec<String>>,
    pub disabled: Option<bool>,
}

/// A freshly issued refresh token. `token` is never stored.
#[derive(Debug, Clone)]
pub struct IssuedAdminToken {
    pub id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

fn invalid_credentials() -> ServiceError {
    ServiceError::Unauthorized("invalid credentials".into())
}

fn check_email(email: &str) -> ServiceResult<String> {
    let email = normalize_email(email);
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(ServiceError::invalid("email", "not an email address")),
    }
}

impl ControlPlaneService {
    fn password_verifier(&self) -> ServiceResult<&Arc<dyn PasswordVerifier>> {
        self.passwords
            .as_ref()
            .ok_or_else(|| ServiceError::Unsupported("no password verifier configured".into()))
    }

    async fn check_assignments(
        &self,
        admin_type: AdminType,
        assigned: &[String],
    ) -> ServiceResult<Vec<String>> {
        if admin_type == AdminType::Global {
            return Ok(Vec::new());
        }
        let assigned = unique_strings(assigned);
        if assigned.is_empty() {
            return Err(ServiceError::invalid(
                "assignedTenants",
                "tenant admins need at least one tenant",
            ));
        }
        let tenants = self.dal.tenants()?;
        for slug in &assigned {
            if !valid_slug(slug) || !tenants.exists(slug).await? {
                return Err(ServiceError::TenantNotFound(slug.clone()));
            }
        }
        Ok(assigned)
    }

    pub async fn create_admin(&self, input: CreateAdmin) -> ServiceResult<Admin> {
        let email = check_email(&input.email)?;
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::invalid("name", "must not be empty"));
        }
        if input.password.is_empty() {
            return Err(ServiceError::invalid("password", "must not be empty"));
        }
        let assigned_tenants = self
            .check_assignments(input.admin_type, &input.assigned_tenants)
            .await?;
        let password_hash = self.password_verifier()?.hash(&input.password)?;

        let now = Utc::now();
        let admin = Admin {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            password_hash,
            name,
            admin_type: input.admin_type,
            assigned_tenants,
            created_at: now,
            updated_at: now,
            last_seen_at: None,
            disabled_at: None,
            created_by: input.created_by,
        };
        self.dal.admins()?.create(&admin).await?;
        tracing::info!(admin = %admin.id, admin_type = ?admin.admin_type, "admin created");
        Ok(admin)
    }

    pub async fn list_admins(&self) -> ServiceResult<Vec<Admin>> {
        Ok(self.dal.admins()?.list().await?)
    }

    pub async fn get_admin(&self, id: &str) -> ServiceResult<Admin> {
        Ok(self.dal.admins()?.get(id).await?)
    }

    pub async fn update_admin(&self, id: &str, input: UpdateAdmin) -> ServiceResult<Admin> {
        let repo = self.dal.admins()?;
        let mut admin = repo.get(id).await?;
        if let Some(name) = input.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(ServiceError::invalid("name", "must not be empty"));
            }
            admin.name = name.to_string();
        }
        if let Some(email) = input.email {
            admin.email = check_email(&email)?;
        }
        if let Some(password) = input.password {
            if password.is_empty() {
                return Err(ServiceError::invalid("password", "must not be empty"));
            }
            admin.password_hash = self.password_verifier()?.hash(&password)?;
        }
        if let Some(assigned) = input.assigned_tenants {
            admin.assigned_tenants = self.check_assignments(admin.admin_type, &assigned).await?;
        }
        let now = Utc::now();
        match input.disabled {
            Some(true) if admin.disabled_at.is_none() => admin.disabled_at = Some(now),
            Some(false) => admin.disabled_at = None,
            _ => {}
        }
        admin.updated_at = now;
        repo.update(&admin).await?;
        Ok(admin)
    }

    pub async fn delete_admin(&self, id: &str) -> ServiceResult<()> {
        self.dal.admins()?.delete(id).await?;
        tracing::info!(admin = id, "admin deleted");
        Ok(())
    }

    /// Check an email and password pair and record the login.
    pub async fn authenticate_admin(&self, email: &str, password: &str) -> ServiceResult<Admin> {
        let verifier = self.password_verifier()?;
        let repo = self.dal.admins()?;
        let mut admin = match repo.get_by_email(&normalize_email(email)).await {
            Ok(admin) => admin,
            Err(err) if err.is_not_found() => return Err(invalid_credentials()),
            Err(err) => return Err(err.into()),
        };
        if admin.is_disabled() || !verifier.verify(password, &admin.password_hash) {
            tracing::warn!(admin = %admin.id, "admin authentication failed");
            return Err(invalid_credentials());
        }
        admin.last_seen_at = Some(Utc::now());
        repo.update(&admin).await?;
        Ok(admin)
    }

    pub async fn issue_admin_token(&self, admin_id: &str, ttl: Duration) -> ServiceResult<IssuedAdminToken> {
        let admin = self.dal.admins()?.get(admin_id).await?;
        if admin.is_disabled() {
            return Err(invalid_credentials());
        }
        let token = generate_token();
        let now = Utc::now();
        let record = AdminRefreshToken {
            id: uuid::Uuid::new_v4().to_string(),
            admin_id: admin.id,
            token_hash: hash_token(&token),
            issued_at: now,
            expires_at: now + ttl,
            revoked_at: None,
        };
        self.dal.admin_tokens()?.create(&record).await?;
        Ok(IssuedAdminToken {
            id: record.id,
            token,
            expires_at: record.expires_at,
        })
    }

    /// Exchange a refresh token for a new one.
    pub async fn refresh_admin_token(
        &self,
        token: &str,
        ttl: Duration,
    ) -> ServiceResult<(Admin, IssuedAdminToken)> {
        let tokens = self.dal.admin_tokens()?;
        let record = match tokens.get_by_hash(&hash_token(token)).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => return Err(invalid_credentials()),
            Err(err) => return Err(err.into()),
        };
        let now = Utc::now();
        if !record.is_usable(now) {
            return Err(ServiceError::TokenExpired("admin refresh token".into()));
        }
        tokens.revoke(&record.id, now).await?;
        let issued = self.issue_admin_token(&record.admin_id, ttl).await?;
        let admin = self.dal.admins()?.get(&record.admin_id).await?;
        Ok((admin, issued))
    }

    pub async fn revoke_admin_token(&self, token: &str) -> ServiceResult<()> {
        let tokens = self.dal.admin_tokens()?;
        let record = tokens.get_by_hash(&hash_token(token)).await?;
        tokens.revoke(&record.id, Utc::now()).await?;
        Ok(())
    }

    /// Refuse tenant admins acting outside their assignments.
    pub fn authorize_tenant(&self, admin: &Admin, slug: &str) -> ServiceResult<()> {
        if admin.is_disabled() || !admin.can_access(slug) {
            return Err(ServiceError::Unauthorized(format!(
                "admin {} cannot manage tenant {slug}",
                admin.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::CreateTenant;
    use crate::service::test_support::service;

    struct PlainVerifier;

    impl PasswordVerifier for PlainVerifier {
        fn hash(&self, password: &str) -> ServiceResult<String> {
            Ok(format!("plain${password}"))
        }

        fn verify(&self, password: &str, hash: &str) -> bool {
            hash.strip_prefix("plain$") == Some(password)
        }
    }

    async fn setup() -> (tempfile::TempDir, ControlPlaneService) {
        let (dir, svc) = service();
        let svc = svc.with_password_verifier(Arc::new(PlainVerifier));
        svc.create_tenant(CreateTenant {
            name: "Acme".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();
        (dir, svc)
    }

    fn ops(admin_type: AdminType, tenants: &[&str]) -> CreateAdmin {
        CreateAdmin {
            email: "  Ops@Example.com ".into(),
            name: "Ops".into(),
            password: "correct horse".into(),
            admin_type,
            assigned_tenants: tenants.iter().map(|s| s.to_string()).collect(),
            created_by: None,
        }
    }

    #[tokio::test]
    async fn create_normalizes_and_authenticates() {
        let (_dir, svc) = setup().await;
        let admin = svc.create_admin(ops(AdminType::Global, &["acme"])).await.unwrap();
        assert_eq!(admin.email, "ops@example.com");
        assert!(admin.assigned_tenants.is_empty());
        assert!(matches!(
            svc.create_admin(ops(AdminType::Global, &[])).await,
            Err(ServiceError::Conflict(_))
        ));

        let logged_in = svc.authenticate_admin("OPS@example.com", "correct horse").await.unwrap();
        assert!(logged_in.last_seen_at.is_some());
        assert!(matches!(
            svc.authenticate_admin("ops@example.com", "wrong").await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(matches!(
            svc.authenticate_admin("nobody@example.com", "x").await,
            Err(ServiceError::Unauthorized(_))
        ));

        svc.update_admin(&admin.id, UpdateAdmin { disabled: Some(true), ..UpdateAdmin::default() })
            .await
            .unwrap();
        assert!(svc.authenticate_admin("ops@example.com", "correct horse").await.is_err());
    }

    #[tokio::test]
    async fn tenant_admins_are_scoped() {
        let (_dir, svc) = setup().await;
        assert!(svc.create_admin(ops(AdminType::Tenant, &[])).await.is_err());
        assert!(matches!(
            svc.create_admin(ops(AdminType::Tenant, &["ghost"])).await,
            Err(ServiceError::TenantNotFound(_))
        ));
        let admin = svc.create_admin(ops(AdminType::Tenant, &["acme"])).await.unwrap();
        svc.authorize_tenant(&admin, "acme").unwrap();
        assert!(matches!(
            svc.authorize_tenant(&admin, "globex"),
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn refresh_tokens_rotate_once() {
        let (dir, svc) = setup().await;
        let admin = svc.create_admin(ops(AdminType::Global, &[])).await.unwrap();
        let issued = svc.issue_admin_token(&admin.id, Duration::hours(1)).await.unwrap();
        let raw = std::fs::read_to_string(dir.path().join("admins/refresh_tokens.yaml")).unwrap();
        assert!(!raw.contains(&issued.token));
        assert!(raw.contains(&hash_token(&issued.token)));

        let (who, next) = svc.refresh_admin_token(&issued.token, Duration::hours(1)).await.unwrap();
        assert_eq!(who.id, admin.id);
        assert_ne!(next.token, issued.token);
        assert!(matches!(
            svc.refresh_admin_token(&issued.token, Duration::hours(1)).await,
            Err(ServiceError::TokenExpired(_))
        ));

        svc.revoke_admin_token(&next.token).await.unwrap();
        assert!(svc.refresh_admin_token(&next.token, Duration::hours(1)).await.is_err());
        assert!(matches!(
            svc.refresh_admin_token("bogus", Duration::hours(1)).await,
            Err(ServiceError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn missing_verifier_is_unsupported() {
        let (_dir, svc) = service();
        assert!(matches!(
            svc.create_admin(ops(AdminType::Global, &[])).await,
            Err(ServiceError::Unsupported(_))
        ));
    }
}
