use super::{PostgresDataPlane, expect_rows};
use crate::model::MfaFactor;
use crate::store::{MfaRepository, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
struct DbMfaFactor {
    id: String,
    tenant_id: String,
    user_id: String,
    method: String,
    secret_enc: String,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
}

impl From<DbMfaFactor> for MfaFactor {
    fn from(row: DbMfaFactor) -> Self {
        MfaFactor {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            method: row.method,
            secret_enc: row.secret_enc,
            created_at: row.created_at,
            confirmed_at: row.confirmed_at,
        }
    }
}

#[async_trait]
impl MfaRepository for PostgresDataPlane {
    async fn list(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<MfaFactor>> {
        let rows = sqlx::query_as::<_, DbMfaFactor>(
            r#"SELECT id, tenant_id, user_id, method, secret_enc, created_at, confirmed_at
               FROM mfa_factors WHERE tenant_id = $1 AND user_id = $2 ORDER BY method"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MfaFactor::from).collect())
    }

    /// Re-enrolling a method replaces its secret and resets confirmation.
    async fn upsert(&self, factor: &MfaFactor) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO mfa_factors
                 (id, tenant_id, user_id, method, secret_enc, created_at, confirmed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (tenant_id, user_id, method) DO UPDATE
                 SET secret_enc = EXCLUDED.secret_enc,
                     created_at = EXCLUDED.created_at,
                     confirmed_at = EXCLUDED.confirmed_at"#,
        )
        .bind(&factor.id)
        .bind(&factor.tenant_id)
        .bind(&factor.user_id)
        .bind(&factor.method)
        .bind(&factor.secret_enc)
        .bind(factor.created_at)
        .bind(factor.confirmed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn confirm(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE mfa_factors SET confirmed_at = COALESCE(confirmed_at, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_rows(result.rows_affected(), || format!("mfa factor {id}"))
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM mfa_factors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_rows(result.rows_affected(), || format!("mfa factor {id}"))
    }
}
