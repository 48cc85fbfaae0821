use super::users::{insert_identity, insert_user};
use super::PostgresDataPlane;
use crate::model::{Identity, IdentityLink, IdentityUpsert, User};
use crate::store::{IdentityRepository, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
struct DbIdentity {
    id: String,
    user_id: String,
    provider: String,
    provider_user_id: String,
    email: String,
    email_verified: bool,
    password_hash: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<DbIdentity> for Identity {
    fn from(row: DbIdentity) -> Self {
        Identity {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider,
            provider_user_id: row.provider_user_id,
            email: row.email,
            email_verified: row.email_verified,
            password_hash: row.password_hash,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl IdentityRepository for PostgresDataPlane {
    async fn upsert(&self, input: &IdentityUpsert) -> StoreResult<IdentityLink> {
        let mut tx = self.pool.begin().await?;

        // Step 1: a known (provider, subject) only refreshes its email data.
        let known: Option<(String, String)> = sqlx::query_as(
            r#"SELECT i.id, i.user_id FROM identities i
               JOIN users u ON u.id = i.user_id
               WHERE i.provider = $1 AND i.provider_user_id = $2 AND u.tenant_id = $3
               FOR UPDATE OF i"#,
        )
        .bind(&input.provider)
        .bind(&input.provider_user_id)
        .bind(&input.tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((identity_id, user_id)) = known {
            sqlx::query("UPDATE identities SET email = $2, email_verified = $3 WHERE id = $1")
                .bind(&identity_id)
                .bind(&input.email)
                .bind(input.email_verified)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(IdentityLink {
                user_id,
                is_new_user: false,
            });
        }

        let identity = |user_id: &str| Identity {
            id: input.new_identity_id.clone(),
            user_id: user_id.to_string(),
            provider: input.provider.clone(),
            provider_user_id: input.provider_user_id.clone(),
            email: input.email.clone(),
            email_verified: input.email_verified,
            password_hash: None,
            created_at: input.now,
        };

        // Step 2: link to an existing user with the same email.
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM users WHERE tenant_id = $1 AND email = $2 FOR UPDATE",
        )
        .bind(&input.tenant_id)
        .bind(&input.email)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(user_id) = existing {
            insert_identity(&mut tx, &identity(&user_id)).await?;
            tx.commit().await?;
            return Ok(IdentityLink {
                user_id,
                is_new_user: false,
            });
        }

        // Step 3: create both.
        let user = User {
            id: input.new_user_id.clone(),
            tenant_id: input.tenant_id.clone(),
            email: input.email.clone(),
            email_verified: input.email_verified,
            name: input.name.clone(),
            custom_fields: Default::default(),
            created_at: input.now,
            updated_at: input.now,
            disabled_at: None,
        };
        insert_user(&mut tx, &user).await?;
        insert_identity(&mut tx, &identity(&user.id)).await?;
        tx.commit().await?;
        Ok(IdentityLink {
            user_id: user.id,
            is_new_user: true,
        })
    }

    async fn list_by_user(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<Identity>> {
        let rows = sqlx::query_as::<_, DbIdentity>(
            r#"SELECT i.id, i.user_id, i.provider, i.provider_user_id, i.email,
                      i.email_verified, i.password_hash, i.created_at
               FROM identities i JOIN users u ON u.id = i.user_id
               WHERE u.tenant_id = $1 AND i.user_id = $2
               ORDER BY i.created_at, i.id"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Identity::from).collect())
    }

    async fn unlink(&self, tenant_id: &str, user_id: &str, identity_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            r#"SELECT i.id FROM identities i JOIN users u ON u.id = i.user_id
               WHERE u.tenant_id = $1 AND i.user_id = $2
               FOR UPDATE OF i"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        if !ids.iter().any(|id| id == identity_id) {
            return Err(StoreError::NotFound(format!("identity {identity_id}")));
        }
        if ids.len() <= 1 {
            return Err(StoreError::LastIdentity(format!(
                "user {user_id} would be left without an identity"
            )));
        }
        sqlx::query("DELETE FROM identities WHERE id = $1")
            .bind(identity_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
