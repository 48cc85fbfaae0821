use super::{PostgresDataPlane, expect_rows};
use crate::model::Consent;
use crate::store::{ConsentRepository, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

const CONSENT_COLUMNS: &str =
    "id, tenant_id, user_id, client_id, scopes, granted_at, updated_at, revoked_at";

#[derive(Debug, FromRow)]
struct DbConsent {
    id: String,
    tenant_id: String,
    user_id: String,
    client_id: String,
    scopes: Vec<String>,
    granted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<DbConsent> for Consent {
    fn from(row: DbConsent) -> Self {
        Consent {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            client_id: row.client_id,
            scopes: row.scopes,
            granted_at: row.granted_at,
            updated_at: row.updated_at,
            revoked_at: row.revoked_at,
        }
    }
}

#[async_trait]
impl ConsentRepository for PostgresDataPlane {
    async fn upsert(&self, consent: &Consent) -> StoreResult<Consent> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, DbConsent>(&format!(
            "SELECT {CONSENT_COLUMNS} FROM consents
             WHERE tenant_id = $1 AND user_id = $2 AND client_id = $3 FOR UPDATE"
        ))
        .bind(&consent.tenant_id)
        .bind(&consent.user_id)
        .bind(&consent.client_id)
        .fetch_optional(&mut *tx)
        .await?;

        let stored = match existing {
            Some(row) => {
                let mut merged = Consent::from(row);
                merged.merge_grant(&consent.scopes, consent.updated_at);
                sqlx::query(
                    "UPDATE consents SET scopes = $2, updated_at = $3, revoked_at = NULL WHERE id = $1",
                )
                .bind(&merged.id)
                .bind(&merged.scopes)
                .bind(merged.updated_at)
                .execute(&mut *tx)
                .await?;
                merged
            }
            None => {
                let mut fresh = consent.clone();
                fresh.revoked_at = None;
                sqlx::query(&format!(
                    "INSERT INTO consents ({CONSENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, NULL)"
                ))
                .bind(&fresh.id)
                .bind(&fresh.tenant_id)
                .bind(&fresh.user_id)
                .bind(&fresh.client_id)
                .bind(&fresh.scopes)
                .bind(fresh.granted_at)
                .bind(fresh.updated_at)
                .execute(&mut *tx)
                .await?;
                fresh
            }
        };
        tx.commit().await?;
        Ok(stored)
    }

    async fn get(
        &self,
        tenant_id: &str,
        user_id: &str,
        client_id: &str,
    ) -> StoreResult<Option<Consent>> {
        let row = sqlx::query_as::<_, DbConsent>(&format!(
            "SELECT {CONSENT_COLUMNS} FROM consents
             WHERE tenant_id = $1 AND user_id = $2 AND client_id = $3"
        ))
        .bind(tenant_id)
        .bind(user_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Consent::from))
    }

    async fn list_by_user(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<Consent>> {
        let rows = sqlx::query_as::<_, DbConsent>(&format!(
            "SELECT {CONSENT_COLUMNS} FROM consents
             WHERE tenant_id = $1 AND user_id = $2 ORDER BY client_id"
        ))
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Consent::from).collect())
    }

    async fn revoke(
        &self,
        tenant_id: &str,
        user_id: &str,
        client_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"UPDATE consents SET revoked_at = COALESCE(revoked_at, $4), updated_at = $4
               WHERE tenant_id = $1 AND user_id = $2 AND client_id = $3"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(client_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        expect_rows(result.rows_affected(), || {
            format!("consent of user {user_id} for client {client_id}")
        })?;
        sqlx::query(
            r#"UPDATE refresh_tokens SET revoked_at = $4
               WHERE tenant_id = $1 AND user_id = $2 AND client_id = $3 AND revoked_at IS NULL"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(client_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn scope_in_use(&self, tenant_id: &str, scope: &str) -> StoreResult<bool> {
        let in_use: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM consents
               WHERE tenant_id = $1 AND revoked_at IS NULL AND $2 = ANY (scopes))"#,
        )
        .bind(tenant_id)
        .bind(scope)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }
}
