//! Data-access layer: one control-plane connection plus one data-plane
//! connection behind a single accessor surface.
use super::{
    AdapterConfig, AdapterRegistry, AdminRepository, AdminTokenRepository, ClaimsRepository,
    ClientRepository, Connection, ConsentRepository, EmailTokenRepository, IdentityRepository,
    MfaRepository, RbacRepository, RefreshTokenRepository, SchemaRepository, ScopeRepository,
    SessionRepository, StoreError, StoreResult, TenantRepository, UserRepository,
};
use crate::keys::KeyStore;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryHealth {
    pub name: String,
    pub backend: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct DataAccess {
    control: Arc<dyn Connection>,
    data: Arc<dyn Connection>,
}

fn require<T: ?Sized>(repo: Option<Arc<T>>, name: &str) -> StoreResult<Arc<T>> {
    repo.ok_or_else(|| StoreError::NotImplemented(format!("{name} repository not available")))
}

impl DataAccess {
    pub fn new(control: Arc<dyn Connection>, data: Arc<dyn Connection>) -> Self {
        Self { control, data }
    }

    /// Open both sides through `registry`.
    pub async fn open(
        registry: &AdapterRegistry,
        control_adapter: &str,
        data_adapter: &str,
        config: AdapterConfig,
    ) -> StoreResult<Self> {
        let control = registry.open(control_adapter, config.clone()).await?;
        let data = match registry.open(data_adapter, config).await {
            Ok(data) => data,
            Err(err) => {
                control.close().await;
                return Err(err);
            }
        };
        Ok(Self::new(control, data))
    }

    pub fn tenants(&self) -> StoreResult<Arc<dyn TenantRepository>> {
        require(self.control.tenants(), "tenant")
    }

    pub fn clients(&self) -> StoreResult<Arc<dyn ClientRepository>> {
        require(self.control.clients(), "client")
    }

    pub fn scopes(&self) -> StoreResult<Arc<dyn ScopeRepository>> {
        require(self.control.scopes(), "scope")
    }

    pub fn claims(&self) -> StoreResult<Arc<dyn ClaimsRepository>> {
        require(self.control.claims(), "claims")
    }

    pub fn admins(&self) -> StoreResult<Arc<dyn AdminRepository>> {
        require(self.control.admins(), "admin")
    }

    pub fn admin_tokens(&self) -> StoreResult<Arc<dyn AdminTokenRepository>> {
        require(self.control.admin_tokens(), "admin refresh token")
    }

    pub fn keys(&self) -> StoreResult<KeyStore> {
        self.control
            .keys()
            .ok_or_else(|| StoreError::NotImplemented("signing key store not available".into()))
    }

    pub fn users(&self) -> StoreResult<Arc<dyn UserRepository>> {
        require(self.data.users(), "user")
    }

    pub fn identities(&self) -> StoreResult<Arc<dyn IdentityRepository>> {
        require(self.data.identities(), "identity")
    }

    pub fn refresh_tokens(&self) -> StoreResult<Arc<dyn RefreshTokenRepository>> {
        require(self.data.refresh_tokens(), "refresh token")
    }

    pub fn sessions(&self) -> StoreResult<Arc<dyn SessionRepository>> {
        require(self.data.sessions(), "session")
    }

    pub fn consents(&self) -> StoreResult<Arc<dyn ConsentRepository>> {
        require(self.data.consents(), "consent")
    }

    pub fn mfa(&self) -> StoreResult<Arc<dyn MfaRepository>> {
        require(self.data.mfa(), "mfa")
    }

    pub fn rbac(&self) -> StoreResult<Arc<dyn RbacRepository>> {
        require(self.data.rbac(), "rbac")
    }

    pub fn email_tokens(&self) -> StoreResult<Arc<dyn EmailTokenRepository>> {
        require(self.data.email_tokens(), "email token")
    }

    pub fn schema(&self) -> StoreResult<Arc<dyn SchemaRepository>> {
        require(self.data.schema(), "schema")
    }

    pub fn control_backend(&self) -> &'static str {
        self.control.backend_name()
    }

    pub fn data_backend(&self) -> &'static str {
        self.data.backend_name()
    }

    /// Ping both connections. A data plane without a database reports as
    /// healthy-but-absent rather than failing.
    pub async fn ping_all(&self) -> Vec<RepositoryHealth> {
        let mut out = Vec::with_capacity(2);
        for (name, conn) in [("control", &self.control), ("data", &self.data)] {
            let result = conn.ping().await;
            let (ok, error) = match result {
                Ok(()) => (true, None),
                Err(err) if err.is_no_database() => (true, Some(err.to_string())),
                Err(err) => (false, Some(err.to_string())),
            };
            out.push(RepositoryHealth {
                name: name.to_string(),
                backend: conn.backend_name().to_string(),
                ok,
                error,
            });
        }
        out
    }

    pub async fn close(&self) {
        self.data.close().await;
        self.control.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fs::FsConnection;
    use crate::store::noop::NoopConnection;

    #[tokio::test]
    async fn control_only_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let config = AdapterConfig {
            fs_root: dir.path().to_path_buf(),
            ..AdapterConfig::default()
        };
        let dal = DataAccess::new(
            Arc::new(FsConnection::open(&config).unwrap()),
            Arc::new(NoopConnection::new()),
        );
        assert!(dal.tenants().is_ok());
        assert!(dal.keys().is_ok());
        let sessions = dal.sessions().unwrap();
        assert!(sessions.get("t1", "s1").await.unwrap_err().is_no_database());

        let health = dal.ping_all().await;
        assert_eq!(health.len(), 2);
        assert!(health.iter().all(|h| h.ok));
        assert_eq!(health[1].backend, "noop");
        dal.close().await;
    }

    #[tokio::test]
    async fn missing_repository_is_not_implemented() {
        let dal = DataAccess::new(Arc::new(NoopConnection::new()), Arc::new(NoopConnection::new()));
        let err = dal.tenants().err().unwrap();
        assert_eq!(err.kind(), crate::store::StoreErrorKind::NotImplemented);
    }
}
