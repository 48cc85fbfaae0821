use super::{ADMIN_TOKENS_FILE, ADMINS_FILE, FsStore, read_list, write_yaml};
use crate::model::{Admin, AdminRefreshToken};
use crate::store::{AdminRepository, AdminTokenRepository, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
impl AdminRepository for FsStore {
    async fn list(&self) -> StoreResult<Vec<Admin>> {
        let _guard = self.read_guard();
        read_list(&self.admins_path(ADMINS_FILE))
    }

    async fn get(&self, id: &str) -> StoreResult<Admin> {
        let _guard = self.read_guard();
        read_list::<Admin>(&self.admins_path(ADMINS_FILE))?
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("admin {id}")))
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Admin> {
        let _guard = self.read_guard();
        read_list::<Admin>(&self.admins_path(ADMINS_FILE))?
            .into_iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| StoreError::NotFound(format!("admin {email}")))
    }

    async fn create(&self, admin: &Admin) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.admins_path(ADMINS_FILE);
        let mut admins: Vec<Admin> = read_list(&path)?;
        if admins
            .iter()
            .any(|a| a.id == admin.id || a.email.eq_ignore_ascii_case(&admin.email))
        {
            return Err(StoreError::Conflict(format!("admin {} already exists", admin.email)));
        }
        admins.push(admin.clone());
        write_yaml(&path, &admins)
    }

    async fn update(&self, admin: &Admin) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.admins_path(ADMINS_FILE);
        let mut admins: Vec<Admin> = read_list(&path)?;
        if admins
            .iter()
            .any(|a| a.id != admin.id && a.email.eq_ignore_ascii_case(&admin.email))
        {
            return Err(StoreError::Conflict(format!("admin {} already exists", admin.email)));
        }
        let slot = admins
            .iter_mut()
            .find(|a| a.id == admin.id)
            .ok_or_else(|| StoreError::NotFound(format!("admin {}", admin.id)))?;
        *slot = admin.clone();
        write_yaml(&path, &admins)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.admins_path(ADMINS_FILE);
        let mut admins: Vec<Admin> = read_list(&path)?;
        let before = admins.len();
        admins.retain(|a| a.id != id);
        if admins.len() == before {
            return Err(StoreError::NotFound(format!("admin {id}")));
        }
        write_yaml(&path, &admins)
    }
}

#[async_trait]
impl AdminTokenRepository for FsStore {
    async fn create(&self, token: &AdminRefreshToken) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.admins_path(ADMIN_TOKENS_FILE);
        let mut tokens: Vec<AdminRefreshToken> = read_list(&path)?;
        if tokens.iter().any(|t| t.token_hash == token.token_hash) {
            return Err(StoreError::Conflict("admin refresh token already stored".into()));
        }
        tokens.push(token.clone());
        write_yaml(&path, &tokens)
    }

    async fn get_by_hash(&self, token_hash: &str) -> StoreResult<AdminRefreshToken> {
        let _guard = self.read_guard();
        read_list::<AdminRefreshToken>(&self.admins_path(ADMIN_TOKENS_FILE))?
            .into_iter()
            .find(|t| t.token_hash == token_hash)
            .ok_or_else(|| StoreError::NotFound("admin refresh token".into()))
    }

    async fn revoke(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let _guard = self.write_guard();
        let path = self.admins_path(ADMIN_TOKENS_FILE);
        let mut tokens: Vec<AdminRefreshToken> = read_list(&path)?;
        let token = tokens
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("admin refresh token {id}")))?;
        if token.revoked_at.is_none() {
            token.revoked_at = Some(at);
        }
        write_yaml(&path, &tokens)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let _guard = self.write_guard();
        let path = self.admins_path(ADMIN_TOKENS_FILE);
        let mut tokens: Vec<AdminRefreshToken> = read_list(&path)?;
        let before = tokens.len();
        tokens.retain(|t| t.is_usable(now));
        let removed = (before - tokens.len()) as u64;
        if removed > 0 {
            write_yaml(&path, &tokens)?;
        }
        Ok(removed)
    }
}
