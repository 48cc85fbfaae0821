use crate::store::{StoreError, StoreResult};
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use std::time::Duration;

const LOCK_SALT: &str = "idplane:tenant-migrations:";

/// Advisory lock id for a tenant: the first eight bytes of a salted SHA-256,
/// big-endian.
pub fn lock_id(tenant: &str) -> i64 {
    let digest = Sha256::digest(format!("{LOCK_SALT}{tenant}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// A session-level Postgres advisory lock pinned to one pooled connection.
///
/// Release with [`AdvisoryLock::release`]. Dropping an unreleased lock closes
/// its connection instead of returning it to the pool, which ends the session
/// and with it the lock.
pub struct AdvisoryLock {
    id: i64,
    conn: Option<PoolConnection<Postgres>>,
}

impl AdvisoryLock {
    /// `pg_try_advisory_lock` first; on contention block in
    /// `pg_advisory_lock` under `lock_timeout`, reported as `LockTimeout`.
    pub async fn acquire(pool: &PgPool, tenant: &str, timeout: Duration) -> StoreResult<Self> {
        let id = lock_id(tenant);
        let mut conn = pool.acquire().await?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            return Ok(Self {
                id,
                conn: Some(conn),
            });
        }

        tracing::debug!(tenant, "migration lock contended; waiting");
        sqlx::query("SELECT set_config('lock_timeout', $1, false)")
            .bind(format!("{}ms", timeout.as_millis().max(1)))
            .execute(&mut *conn)
            .await?;
        let waited = sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(id)
            .execute(&mut *conn)
            .await;
        let reset = sqlx::query("SELECT set_config('lock_timeout', '0', false)")
            .execute(&mut *conn)
            .await;

        match waited {
            Ok(_) => {
                reset?;
                Ok(Self {
                    id,
                    conn: Some(conn),
                })
            }
            Err(err) => {
                if reset.is_err() {
                    conn.close_on_drop();
                }
                match StoreError::from(err) {
                    StoreError::LockTimeout(_) => Err(StoreError::LockTimeout(format!(
                        "migration lock for tenant {tenant} not acquired within {timeout:?}"
                    ))),
                    other => Err(other),
                }
            }
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// The session that holds the lock.
    pub fn connection(&mut self) -> StoreResult<&mut PgConnection> {
        self.conn.as_deref_mut().ok_or_else(|| {
            StoreError::Unexpected(anyhow::anyhow!("advisory lock {} has no connection", self.id))
        })
    }

    pub async fn release(mut self) -> StoreResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.id)
            .fetch_one(&mut *conn)
            .await;
        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                conn.close_on_drop();
                Err(StoreError::Unexpected(anyhow::anyhow!(
                    "advisory lock {} was not held",
                    self.id
                )))
            }
            Err(err) => {
                conn.close_on_drop();
                Err(err.into())
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            tracing::warn!(lock_id = self.id, "advisory lock dropped without release; closing its connection");
            conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_are_stable_and_distinct() {
        assert_eq!(lock_id("acme"), lock_id("acme"));
        assert_ne!(lock_id("acme"), lock_id("globex"));
        let digest = Sha256::digest(b"idplane:tenant-migrations:acme");
        let expected = i64::from_be_bytes(digest[..8].try_into().unwrap());
        assert_eq!(lock_id("acme"), expected);
    }
}
