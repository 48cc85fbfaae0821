use super::PostgresDataPlane;
use crate::model::{EmailToken, EmailTokenPurpose};
use crate::store::{EmailTokenRepository, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
struct DbEmailToken {
    id: String,
    tenant_id: String,
    user_id: String,
    purpose: String,
    token_hash: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbEmailToken> for EmailToken {
    type Error = StoreError;

    fn try_from(row: DbEmailToken) -> StoreResult<Self> {
        let purpose = EmailTokenPurpose::parse(&row.purpose).ok_or_else(|| {
            StoreError::Unexpected(anyhow::anyhow!("unknown email token purpose {:?}", row.purpose))
        })?;
        Ok(EmailToken {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            purpose,
            token_hash: row.token_hash,
            created_at: row.created_at,
            expires_at: row.expires_at,
            used_at: row.used_at,
        })
    }
}

#[async_trait]
impl EmailTokenRepository for PostgresDataPlane {
    async fn create(&self, token: &EmailToken) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO email_tokens
                 (id, tenant_id, user_id, purpose, token_hash, created_at, expires_at, used_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(&token.id)
        .bind(&token.tenant_id)
        .bind(&token.user_id)
        .bind(token.purpose.as_str())
        .bind(&token.token_hash)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume(&self, token_hash: &str, now: DateTime<Utc>) -> StoreResult<EmailToken> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, DbEmailToken>(
            r#"SELECT id, tenant_id, user_id, purpose, token_hash, created_at, expires_at, used_at
               FROM email_tokens WHERE token_hash = $1 FOR UPDATE"#,
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound("email token".into()))?;
        let mut token = EmailToken::try_from(row)?;
        if token.used_at.is_some() || now >= token.expires_at {
            return Err(StoreError::TokenExpired("email token expired or already used".into()));
        }
        sqlx::query("UPDATE email_tokens SET used_at = $2 WHERE id = $1")
            .bind(&token.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        token.used_at = Some(now);
        Ok(token)
    }

    /// Expired and already used tokens can never be consumed again.
    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM email_tokens WHERE expires_at <= $1 OR used_at IS NOT NULL")
                .bind(now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
