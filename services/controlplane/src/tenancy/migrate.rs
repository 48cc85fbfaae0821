use crate::store::{StoreError, StoreResult};
use sqlx::{Connection, PgConnection};
use std::fs;
use std::path::{Path, PathBuf};

/// Scripts compiled into the binary, used when the configured directory does
/// not exist.
const BUILTIN: &[(&str, &str)] = &[(
    "0001_init_up.sql",
    include_str!("../../migrations/tenant/0001_init_up.sql"),
)];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    name       TEXT PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub name: String,
    pub sql: String,
}

/// Applies lexicographically ordered `*_up.sql` scripts, each in its own
/// transaction, recording applied names in `schema_migrations`. Everything
/// runs on the one connection it is given.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    dir: PathBuf,
}

impl MigrationRunner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scripts(&self) -> StoreResult<Vec<MigrationScript>> {
        if !self.dir.is_dir() {
            return Ok(BUILTIN
                .iter()
                .map(|(name, sql)| MigrationScript {
                    name: (*name).to_string(),
                    sql: (*sql).to_string(),
                })
                .collect());
        }
        load_scripts(&self.dir)
    }

    pub async fn run(&self, conn: &mut PgConnection) -> StoreResult<MigrationReport> {
        let scripts = self.scripts()?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(TRACKING_TABLE)).await?;

        let mut report = MigrationReport::default();
        for script in scripts {
            let done: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE name = $1)",
            )
            .bind(&script.name)
            .fetch_one(&mut *conn)
            .await?;
            if done {
                report.skipped += 1;
                continue;
            }

            let mut tx = conn.begin().await?;
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&script.sql))
                .await
                .map_err(|err| StoreError::from(err).context(format!("migration {}", script.name)))?;
            sqlx::query("INSERT INTO schema_migrations (name) VALUES ($1)")
                .bind(&script.name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            report.applied += 1;
        }

        metrics::counter!("tenant_migrations_total", "outcome" => "applied")
            .increment(report.applied as u64);
        metrics::counter!("tenant_migrations_total", "outcome" => "skipped")
            .increment(report.skipped as u64);
        Ok(report)
    }
}

fn load_scripts(dir: &Path) -> StoreResult<Vec<MigrationScript>> {
    let mut scripts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.ends_with("_up.sql") || !entry.file_type()?.is_file() {
            continue;
        }
        let sql = fs::read_to_string(entry.path())?;
        scripts.push(MigrationScript { name, sql });
    }
    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_are_filtered_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0002_roles_up.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("0001_init_up.sql"), "SELECT 1;").unwrap();
        fs::write(dir.path().join("0001_init_down.sql"), "SELECT 0;").unwrap();
        fs::write(dir.path().join("README.md"), "notes").unwrap();

        let names: Vec<_> = MigrationRunner::new(dir.path())
            .scripts()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["0001_init_up.sql", "0002_roles_up.sql"]);
    }

    #[test]
    fn missing_directory_uses_builtin_scripts() {
        let scripts = MigrationRunner::new("/nonexistent/migrations").scripts().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].sql.contains("CREATE TABLE IF NOT EXISTS users"));
    }
}
