use super::schema::{SYSTEM_USER_COLUMNS, sanitize_identifier};
use super::{PostgresDataPlane, expect_rows};
use crate::model::{Identity, User};
use crate::store::{StoreError, StoreResult, UserRepository};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{Postgres, Transaction};

/// Flatten a user into one JSON object keyed by column name, the shape
/// `jsonb_populate_record(NULL::users, ..)` expects.
pub(super) fn user_document(user: &User) -> StoreResult<Value> {
    let mut doc = Map::new();
    doc.insert("id".into(), Value::String(user.id.clone()));
    doc.insert("tenant_id".into(), Value::String(user.tenant_id.clone()));
    doc.insert("email".into(), Value::String(user.email.clone()));
    doc.insert("email_verified".into(), Value::Bool(user.email_verified));
    doc.insert("name".into(), Value::String(user.name.clone()));
    doc.insert("created_at".into(), serde_json::to_value(user.created_at)?);
    doc.insert("updated_at".into(), serde_json::to_value(user.updated_at)?);
    doc.insert("disabled_at".into(), serde_json::to_value(user.disabled_at)?);
    for (key, value) in &user.custom_fields {
        let column = custom_column(key)?;
        doc.insert(column, value.clone());
    }
    Ok(Value::Object(doc))
}

/// A custom field key must already be a sanitized, non-system identifier.
fn custom_column(key: &str) -> StoreResult<String> {
    match sanitize_identifier(key) {
        Some(column) if column == key && !SYSTEM_USER_COLUMNS.contains(&key) => Ok(column),
        _ => Err(StoreError::InvalidInput(format!("invalid custom user field {key:?}"))),
    }
}

/// Inverse of [`user_document`]: system columns go to fields, every other
/// non-null column into `custom_fields`.
pub(super) fn user_from_document(doc: Value) -> StoreResult<User> {
    let Value::Object(mut map) = doc else {
        return Err(StoreError::Unexpected(anyhow::anyhow!("user row is not an object")));
    };
    let mut system = Map::new();
    for column in SYSTEM_USER_COLUMNS {
        if let Some(value) = map.remove(*column) {
            system.insert((*column).to_string(), value);
        }
    }
    let custom_fields: Map<String, Value> =
        map.into_iter().filter(|(_, value)| !value.is_null()).collect();
    system.insert("custom_fields".into(), Value::Object(custom_fields));
    Ok(serde_json::from_value(Value::Object(system))?)
}

pub(super) async fn insert_identity(
    tx: &mut Transaction<'_, Postgres>,
    identity: &Identity,
) -> StoreResult<()> {
    sqlx::query(
        r#"INSERT INTO identities
            (id, user_id, provider, provider_user_id, email, email_verified, password_hash, created_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
    )
    .bind(&identity.id)
    .bind(&identity.user_id)
    .bind(&identity.provider)
    .bind(&identity.provider_user_id)
    .bind(&identity.email)
    .bind(identity.email_verified)
    .bind(&identity.password_hash)
    .bind(identity.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(super) async fn insert_user(tx: &mut Transaction<'_, Postgres>, user: &User) -> StoreResult<()> {
    sqlx::query("INSERT INTO users SELECT * FROM jsonb_populate_record(NULL::users, $1)")
        .bind(user_document(user)?)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fetch_users(
    plane: &PostgresDataPlane,
    filter: &str,
    binds: &[&str],
    page: Option<(i64, i64)>,
) -> StoreResult<Vec<User>> {
    let mut sql = format!("SELECT to_jsonb(u) FROM users u WHERE {filter} ORDER BY u.created_at, u.id");
    if page.is_some() {
        let n = binds.len();
        sql.push_str(&format!(" LIMIT ${} OFFSET ${}", n + 1, n + 2));
    }
    let mut query = sqlx::query_scalar::<_, Value>(&sql);
    for bind in binds {
        query = query.bind(*bind);
    }
    if let Some((limit, offset)) = page {
        query = query.bind(limit).bind(offset);
    }
    query
        .fetch_all(&plane.pool)
        .await?
        .into_iter()
        .map(user_from_document)
        .collect()
}

#[async_trait]
impl UserRepository for PostgresDataPlane {
    async fn create(&self, user: &User, password_identity: &Identity) -> StoreResult<()> {
        if password_identity.user_id != user.id {
            return Err(StoreError::InvalidInput(
                "password identity belongs to another user".into(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        insert_user(&mut tx, user)
            .await
            .map_err(|err| err.context(format!("create user {}", user.email)))?;
        insert_identity(&mut tx, password_identity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> StoreResult<User> {
        fetch_users(self, "u.tenant_id = $1 AND u.id = $2", &[tenant_id, id], None)
            .await?
            .pop()
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn get_by_email(&self, tenant_id: &str, email: &str) -> StoreResult<User> {
        fetch_users(self, "u.tenant_id = $1 AND u.email = $2", &[tenant_id, email], None)
            .await?
            .pop()
            .ok_or_else(|| StoreError::NotFound(format!("user {email}")))
    }

    async fn list(&self, tenant_id: &str, limit: i64, offset: i64) -> StoreResult<Vec<User>> {
        let limit = if limit <= 0 { 50 } else { limit.min(1000) };
        fetch_users(self, "u.tenant_id = $1", &[tenant_id], Some((limit, offset.max(0)))).await
    }

    async fn update(&self, user: &User) -> StoreResult<()> {
        let mut assignments: Vec<String> = ["email", "email_verified", "name", "updated_at", "disabled_at"]
            .iter()
            .map(|column| format!("{column} = r.{column}"))
            .collect();
        for key in user.custom_fields.keys() {
            let column = custom_column(key)?;
            assignments.push(format!("{column} = r.{column}"));
        }
        let sql = format!(
            "UPDATE users u SET {} FROM jsonb_populate_record(NULL::users, $1) r \
             WHERE u.tenant_id = r.tenant_id AND u.id = r.id",
            assignments.join(", ")
        );
        let result = sqlx::query(&sql)
            .bind(user_document(user)?)
            .execute(&self.pool)
            .await?;
        expect_rows(result.rows_affected(), || format!("user {}", user.id))
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_rows(result.rows_affected(), || format!("user {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn user() -> User {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut custom_fields = Map::new();
        custom_fields.insert("department".into(), json!("sales"));
        User {
            id: "u1".into(),
            tenant_id: "t1".into(),
            email: "ana@acme.test".into(),
            email_verified: true,
            name: "Ana".into(),
            custom_fields,
            created_at: at,
            updated_at: at,
            disabled_at: None,
        }
    }

    #[test]
    fn document_flattens_custom_fields() {
        let doc = user_document(&user()).unwrap();
        assert_eq!(doc["department"], json!("sales"));
        assert_eq!(doc["email"], json!("ana@acme.test"));
        assert!(doc.get("custom_fields").is_none());
        assert_eq!(user_from_document(doc).unwrap(), user());
    }

    #[test]
    fn null_custom_columns_are_omitted_on_read() {
        let mut doc = user_document(&user()).unwrap();
        doc["badge"] = Value::Null;
        let read = user_from_document(doc).unwrap();
        assert!(!read.custom_fields.contains_key("badge"));
    }

    #[test]
    fn unsafe_custom_keys_are_rejected() {
        for key in ["Department", "x; DROP TABLE users", "email", "1st"] {
            let mut u = user();
            u.custom_fields.insert(key.into(), json!(1));
            assert_eq!(
                user_document(&u).unwrap_err().kind(),
                crate::store::StoreErrorKind::InvalidInput,
                "{key}"
            );
        }
    }
}
