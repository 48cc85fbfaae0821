use super::{PostgresDataPlane, expect_rows, non_empty};
use crate::model::{Session, SessionFilter, SessionStatus, SessionView};
use crate::store::{SessionRepository, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;

const SESSION_COLUMNS: &str = "id, tenant_id, user_id, session_id_hash, ip, user_agent, device, \
    browser, os, country, city, created_at, last_activity, expires_at, revoked_at, revoked_by, \
    revoke_reason";

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

#[derive(Debug, FromRow)]
struct DbSession {
    id: String,
    tenant_id: String,
    user_id: String,
    session_id_hash: String,
    ip: String,
    user_agent: String,
    device: String,
    browser: String,
    os: String,
    country: String,
    city: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revoked_by: Option<String>,
    revoke_reason: Option<String>,
}

impl From<DbSession> for Session {
    fn from(row: DbSession) -> Self {
        Session {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            session_id_hash: row.session_id_hash,
            ip: non_empty(row.ip),
            user_agent: non_empty(row.user_agent),
            device: non_empty(row.device),
            browser: non_empty(row.browser),
            os: non_empty(row.os),
            country: non_empty(row.country),
            city: non_empty(row.city),
            created_at: row.created_at,
            last_activity: row.last_activity,
            expires_at: row.expires_at,
            revoked_at: row.revoked_at,
            revoked_by: row.revoked_by,
            revoke_reason: row.revoke_reason,
        }
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern and wrap it for substring
/// matching.
fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// Append the WHERE clause equivalent of [`SessionStatus::derive`].
fn push_status(
    builder: &mut QueryBuilder<'_, Postgres>,
    status: SessionStatus,
    now: DateTime<Utc>,
    idle_cutoff: DateTime<Utc>,
) {
    match status {
        SessionStatus::Revoked => {
            builder.push(" AND revoked_at IS NOT NULL");
        }
        SessionStatus::Expired => {
            builder.push(" AND revoked_at IS NULL AND expires_at <= ").push_bind(now);
        }
        SessionStatus::Idle => {
            builder
                .push(" AND revoked_at IS NULL AND expires_at > ")
                .push_bind(now)
                .push(" AND last_activity < ")
                .push_bind(idle_cutoff);
        }
        SessionStatus::Active => {
            builder
                .push(" AND revoked_at IS NULL AND expires_at > ")
                .push_bind(now)
                .push(" AND last_activity >= ")
                .push_bind(idle_cutoff);
        }
    }
}

fn list_query(
    filter: &SessionFilter,
    now: DateTime<Utc>,
    idle_after: Duration,
) -> QueryBuilder<'static, Postgres> {
    let idle_cutoff = now
        - chrono::Duration::from_std(idle_after).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let mut builder = QueryBuilder::new(format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = "));
    builder.push_bind(filter.tenant_id.clone());
    if let Some(user_id) = &filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(device) = &filter.device {
        builder.push(" AND device = ").push_bind(device.clone());
    }
    if let Some(status) = filter.status {
        push_status(&mut builder, status, now, idle_cutoff);
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = like_pattern(search);
        builder
            .push(" AND (ip ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR city ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR country ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    let limit = if filter.limit <= 0 { DEFAULT_PAGE } else { filter.limit.min(MAX_PAGE) };
    builder
        .push(" ORDER BY last_activity DESC, id LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(filter.offset.max(0));
    builder
}

#[async_trait]
impl SessionRepository for PostgresDataPlane {
    async fn create(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(&session.id)
        .bind(&session.tenant_id)
        .bind(&session.user_id)
        .bind(&session.session_id_hash)
        .bind(session.ip.clone().unwrap_or_default())
        .bind(session.user_agent.clone().unwrap_or_default())
        .bind(session.device.clone().unwrap_or_default())
        .bind(session.browser.clone().unwrap_or_default())
        .bind(session.os.clone().unwrap_or_default())
        .bind(session.country.clone().unwrap_or_default())
        .bind(session.city.clone().unwrap_or_default())
        .bind(session.created_at)
        .bind(session.last_activity)
        .bind(session.expires_at)
        .bind(session.revoked_at)
        .bind(&session.revoked_by)
        .bind(&session.revoke_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query_as::<_, DbSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn get_by_hash(&self, session_id_hash: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query_as::<_, DbSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id_hash = $1"
        ))
        .bind(session_id_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn list(
        &self,
        filter: &SessionFilter,
        now: DateTime<Utc>,
        idle_after: Duration,
    ) -> StoreResult<Vec<SessionView>> {
        let mut builder = list_query(filter, now, idle_after);
        let rows = builder
            .build_query_as::<DbSession>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let session = Session::from(row);
                let status = SessionStatus::derive(&session, now, idle_after);
                SessionView { session, status }
            })
            .collect())
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET last_activity = GREATEST(last_activity, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_rows(result.rows_affected(), || format!("session {id}"))
    }

    async fn revoke(
        &self,
        id: &str,
        by: Option<&str>,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"UPDATE sessions
               SET revoked_at = COALESCE(revoked_at, $4),
                   revoked_by = COALESCE(revoked_by, $2),
                   revoke_reason = COALESCE(revoke_reason, $3)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(by)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_rows(result.rows_affected(), || format!("session {id}"))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
