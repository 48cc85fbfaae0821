//! Users-table introspection and custom field reconciliation.
use super::PostgresDataPlane;
use crate::model::UserFieldDef;
use crate::store::{ColumnInfo, FieldSyncReport, SchemaRepository, StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::{BTreeMap, BTreeSet};

/// Columns owned by the base schema; never added, dropped or altered by sync.
pub const SYSTEM_USER_COLUMNS: &[&str] = &[
    "id",
    "tenant_id",
    "email",
    "email_verified",
    "name",
    "created_at",
    "updated_at",
    "disabled_at",
];

const MAX_IDENTIFIER_LEN: usize = 63;

/// Lowercase ASCII letters, digits and underscores, not starting with a
/// digit, at most 63 bytes. Other characters become `_`; a leading digit gets
/// an `f_` prefix. `None` when nothing usable remains.
pub fn sanitize_identifier(name: &str) -> Option<String> {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' }
        })
        .collect();
    if out.trim_matches('_').is_empty() {
        return None;
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "f_");
    }
    out.truncate(MAX_IDENTIFIER_LEN);
    Some(out)
}

/// Double-quoted SQL identifier with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn unique_index(column: &str) -> String {
    quote_ident(&format!("users_uq_{column}"))
}

fn plain_index(column: &str) -> String {
    quote_ident(&format!("users_ix_{column}"))
}

#[derive(Debug, FromRow)]
struct DbColumn {
    column_name: String,
    data_type: String,
    nullable: bool,
    is_unique: bool,
    indexed: bool,
}

const COLUMNS_SQL: &str = r#"
SELECT c.column_name::text AS column_name,
       c.data_type::text   AS data_type,
       (c.is_nullable = 'YES') AS nullable,
       EXISTS (SELECT 1 FROM pg_indexes i
               WHERE i.schemaname = current_schema() AND i.tablename = 'users'
                 AND i.indexname = 'users_uq_' || c.column_name) AS is_unique,
       EXISTS (SELECT 1 FROM pg_indexes i
               WHERE i.schemaname = current_schema() AND i.tablename = 'users'
                 AND i.indexname = 'users_ix_' || c.column_name) AS indexed
FROM information_schema.columns c
WHERE c.table_schema = current_schema() AND c.table_name = 'users'
ORDER BY c.ordinal_position"#;

async fn load_columns(tx: &mut Transaction<'_, Postgres>) -> StoreResult<Vec<ColumnInfo>> {
    let rows = sqlx::query_as::<_, DbColumn>(COLUMNS_SQL)
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| ColumnInfo {
            name: row.column_name,
            data_type: row.data_type,
            nullable: row.nullable,
            unique: row.is_unique,
            indexed: row.indexed,
        })
        .collect())
}

/// Sanitize and de-duplicate the requested fields, refusing system names.
fn normalize_fields(fields: &[UserFieldDef]) -> StoreResult<BTreeMap<String, &UserFieldDef>> {
    let mut out = BTreeMap::new();
    for field in fields {
        let column = sanitize_identifier(&field.name).ok_or_else(|| {
            StoreError::InvalidInput(format!("invalid user field name {:?}", field.name))
        })?;
        if SYSTEM_USER_COLUMNS.contains(&column.as_str()) {
            return Err(StoreError::InvalidInput(format!(
                "user field {column:?} collides with a system column"
            )));
        }
        if out.insert(column.clone(), field).is_some() {
            return Err(StoreError::InvalidInput(format!("duplicate user field {column:?}")));
        }
    }
    Ok(out)
}

/// DDL statements that bring `current` in line with `wanted`, plus the
/// report of what they change.
fn plan_sync(
    current: &[ColumnInfo],
    wanted: &BTreeMap<String, &UserFieldDef>,
) -> (Vec<String>, FieldSyncReport) {
    let mut statements = Vec::new();
    let mut report = FieldSyncReport::default();
    let existing: BTreeMap<&str, &ColumnInfo> =
        current.iter().map(|c| (c.name.as_str(), c)).collect();

    for (column, field) in wanted {
        let ident = quote_ident(column);
        let (nullable, unique, indexed) = match existing.get(column.as_str()) {
            Some(info) => (info.nullable, info.unique, info.indexed),
            None => {
                statements.push(format!(
                    "ALTER TABLE users ADD COLUMN {ident} {}",
                    field.field_type.sql_type()
                ));
                report.added.push(column.clone());
                (true, false, false)
            }
        };
        let mut altered = false;
        if field.required == nullable {
            let action = if field.required { "SET" } else { "DROP" };
            statements.push(format!("ALTER TABLE users ALTER COLUMN {ident} {action} NOT NULL"));
            altered = true;
        }
        if field.unique && !unique {
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON users (tenant_id, {ident})",
                unique_index(column)
            ));
            altered = true;
        } else if !field.unique && unique {
            statements.push(format!("DROP INDEX IF EXISTS {}", unique_index(column)));
            altered = true;
        }
        if field.indexed && !indexed {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON users (tenant_id, {ident})",
                plain_index(column)
            ));
            altered = true;
        } else if !field.indexed && indexed {
            statements.push(format!("DROP INDEX IF EXISTS {}", plain_index(column)));
            altered = true;
        }
        if altered && existing.contains_key(column.as_str()) {
            report.altered.push(column.clone());
        }
    }

    let wanted_names: BTreeSet<&str> = wanted.keys().map(String::as_str).collect();
    for info in current {
        let name = info.name.as_str();
        if SYSTEM_USER_COLUMNS.contains(&name) || wanted_names.contains(name) {
            continue;
        }
        // Only columns that sanitize to themselves were created by sync.
        if sanitize_identifier(name).as_deref() != Some(name) {
            continue;
        }
        statements.push(format!(
            "ALTER TABLE users DROP COLUMN IF EXISTS {}",
            quote_ident(name)
        ));
        report.dropped.push(name.to_string());
    }
    (statements, report)
}

#[async_trait]
impl SchemaRepository for PostgresDataPlane {
    async fn user_columns(&self) -> StoreResult<Vec<ColumnInfo>> {
        let mut tx = self.pool.begin().await?;
        let columns = load_columns(&mut tx).await?;
        tx.commit().await?;
        Ok(columns)
    }

    async fn sync_user_fields(&self, fields: &[UserFieldDef]) -> StoreResult<FieldSyncReport> {
        let wanted = normalize_fields(fields)?;
        let mut tx = self.pool.begin().await?;
        // Serialize concurrent syncs on this table.
        sqlx::query("LOCK TABLE users IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        let current = load_columns(&mut tx).await?;
        let (statements, report) = plan_sync(&current, &wanted);
        for statement in &statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::from(err).context(statement.clone()))?;
        }
        tx.commit().await?;
        tracing::info!(
            added = report.added.len(),
            dropped = report.dropped.len(),
            altered = report.altered.len(),
            "user fields synchronized"
        );
        Ok(report)
    }
}
