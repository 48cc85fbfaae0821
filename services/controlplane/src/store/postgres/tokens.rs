use super::{PostgresDataPlane, expect_rows};
use crate::model::{RefreshToken, TokenStats};
use crate::store::{RefreshTokenRepository, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::FromRow;

const TOKEN_COLUMNS: &str =
    "id, tenant_id, client_id, user_id, token_hash, issued_at, expires_at, rotated_from, revoked_at";

#[derive(Debug, FromRow)]
struct DbRefreshToken {
    id: String,
    tenant_id: String,
    client_id: String,
    user_id: String,
    token_hash: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    rotated_from: Option<String>,
    revoked_at: Option<DateTime<Utc>>,
}

impl From<DbRefreshToken> for RefreshToken {
    fn from(row: DbRefreshToken) -> Self {
        RefreshToken {
            id: row.id,
            tenant_id: row.tenant_id,
            client_id: row.client_id,
            user_id: row.user_id,
            token_hash: row.token_hash,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            rotated_from: row.rotated_from,
            revoked_at: row.revoked_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbTokenStats {
    active: i64,
    issued_today: i64,
    revoked_today: i64,
    avg_lifetime_secs: f64,
}

/// Midnight UTC of `now`'s day.
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

async fn insert<'e, E>(executor: E, token: &RefreshToken, rotated_from: Option<&str>) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(&format!(
        "INSERT INTO refresh_tokens ({TOKEN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    ))
    .bind(&token.id)
    .bind(&token.tenant_id)
    .bind(&token.client_id)
    .bind(&token.user_id)
    .bind(&token.token_hash)
    .bind(token.issued_at)
    .bind(token.expires_at)
    .bind(rotated_from)
    .bind(token.revoked_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl RefreshTokenRepository for PostgresDataPlane {
    async fn create(&self, token: &RefreshToken) -> StoreResult<()> {
        insert(&self.pool, token, token.rotated_from.as_deref()).await
    }

    async fn get_by_hash(&self, token_hash: &str) -> StoreResult<RefreshToken> {
        sqlx::query_as::<_, DbRefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .map(RefreshToken::from)
        .ok_or_else(|| StoreError::NotFound("refresh token".into()))
    }

    async fn rotate(&self, old_id: &str, next: &RefreshToken) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let revoked = sqlx::query(
            r#"UPDATE refresh_tokens SET revoked_at = $2
               WHERE id = $1 AND revoked_at IS NULL AND expires_at > $2"#,
        )
        .bind(old_id)
        .bind(next.issued_at)
        .execute(&mut *tx)
        .await?;
        if revoked.rows_affected() == 0 {
            return Err(StoreError::TokenExpired(format!(
                "refresh token {old_id} is no longer active"
            )));
        }
        insert(&mut *tx, next, Some(old_id)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revoke(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE refresh_tokens SET revoked_at = COALESCE(revoked_at, $2) WHERE id = $1")
                .bind(id)
                .bind(at)
                .execute(&self.pool)
                .await?;
        expect_rows(result.rows_affected(), || format!("refresh token {id}"))
    }

    async fn revoke_all_by_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        client_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"UPDATE refresh_tokens SET revoked_at = $4
               WHERE tenant_id = $1 AND user_id = $2
                 AND ($3::text IS NULL OR client_id = $3)
                 AND revoked_at IS NULL"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(client_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, tenant_id: &str, now: DateTime<Utc>) -> StoreResult<TokenStats> {
        let row = sqlx::query_as::<_, DbTokenStats>(
            r#"SELECT
                 COUNT(*) FILTER (WHERE revoked_at IS NULL AND expires_at > $2) AS active,
                 COUNT(*) FILTER (WHERE issued_at >= $3) AS issued_today,
                 COUNT(*) FILTER (WHERE revoked_at >= $3) AS revoked_today,
                 COALESCE(AVG(EXTRACT(EPOCH FROM (expires_at - issued_at))), 0)::float8
                   AS avg_lifetime_secs
               FROM refresh_tokens WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .bind(now)
        .bind(start_of_day(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(TokenStats {
            active: row.active,
            issued_today: row.issued_today,
            revoked_today: row.revoked_today,
            avg_lifetime_secs: row.avg_lifetime_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_starts_at_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 17, 42, 9).unwrap();
        assert_eq!(start_of_day(now), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
    }
}
