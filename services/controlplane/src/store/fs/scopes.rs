use super::{FsStore, SCOPES_FILE, read_list, write_yaml};
use crate::model::Scope;
use crate::store::{ScopeRepository, StoreError, StoreResult};
use async_trait::async_trait;

#[async_trait]
impl ScopeRepository for FsStore {
    async fn list(&self, tenant: &str) -> StoreResult<Vec<Scope>> {
        let _guard = self.read_guard();
        let dir = self.existing_tenant_dir(tenant)?;
        read_list(&dir.join(SCOPES_FILE))
    }

    async fn get(&self, tenant: &str, name: &str) -> StoreResult<Scope> {
        let _guard = self.read_guard();
        let dir = self.existing_tenant_dir(tenant)?;
        read_list::<Scope>(&dir.join(SCOPES_FILE))?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| StoreError::NotFound(format!("scope {name} in tenant {tenant}")))
    }

    async fn upsert(&self, tenant: &str, scope: &Scope) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.existing_tenant_dir(tenant)?.join(SCOPES_FILE);
        let mut scopes: Vec<Scope> = read_list(&path)?;
        match scopes.iter_mut().find(|s| s.name == scope.name) {
            Some(slot) => *slot = scope.clone(),
            None => scopes.push(scope.clone()),
        }
        write_yaml(&path, &scopes)
    }

    async fn delete(&self, tenant: &str, name: &str) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.existing_tenant_dir(tenant)?.join(SCOPES_FILE);
        let mut scopes: Vec<Scope> = read_list(&path)?;
        let before = scopes.len();
        scopes.retain(|s| s.name != name);
        if scopes.len() == before {
            return Err(StoreError::NotFound(format!("scope {name} in tenant {tenant}")));
        }
        write_yaml(&path, &scopes)
    }
}
