use super::{PostgresDataPlane, expect_rows};
use crate::model::Role;
use crate::store::{RbacRepository, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
struct DbRole {
    id: String,
    tenant_id: String,
    name: String,
    description: String,
    permissions: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<DbRole> for Role {
    fn from(row: DbRole) -> Self {
        Role {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            description: row.description,
            permissions: row.permissions,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl RbacRepository for PostgresDataPlane {
    async fn create_role(&self, role: &Role) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO roles (id, tenant_id, name, description, permissions, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&role.id)
        .bind(&role.tenant_id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(&role.permissions)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::from(err).context(format!("role {}", role.name)))?;
        Ok(())
    }

    async fn list_roles(&self, tenant_id: &str) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, DbRole>(
            r#"SELECT id, tenant_id, name, description, permissions, created_at
               FROM roles WHERE tenant_id = $1 ORDER BY name"#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn delete_role(&self, tenant_id: &str, role_id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM roles WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        expect_rows(result.rows_affected(), || format!("role {role_id}"))
    }

    /// Assigning twice is a no-op; the role must belong to the tenant.
    async fn assign(&self, tenant_id: &str, user_id: &str, role_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO user_roles (tenant_id, user_id, role_id)
               SELECT $1, $2, id FROM roles WHERE tenant_id = $1 AND id = $3
               ON CONFLICT DO NOTHING"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM roles WHERE tenant_id = $1 AND id = $2)",
            )
            .bind(tenant_id)
            .bind(role_id)
            .fetch_one(&self.pool)
            .await?;
            if !exists {
                return Err(StoreError::NotFound(format!("role {role_id}")));
            }
        }
        Ok(())
    }

    async fn unassign(&self, tenant_id: &str, user_id: &str, role_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM user_roles WHERE tenant_id = $1 AND user_id = $2 AND role_id = $3",
        )
        .bind(tenant_id)
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        expect_rows(result.rows_affected(), || {
            format!("role {role_id} assignment of user {user_id}")
        })
    }

    async fn roles_for_user(&self, tenant_id: &str, user_id: &str) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, DbRole>(
            r#"SELECT r.id, r.tenant_id, r.name, r.description, r.permissions, r.created_at
               FROM roles r JOIN user_roles ur ON ur.role_id = r.id
               WHERE ur.tenant_id = $1 AND ur.user_id = $2
               ORDER BY r.name"#,
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }
}
