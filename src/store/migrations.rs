//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! On first run against a legacy DB (a `jobs` table written by the old
//! service, no `_migrations` table), it adds the columns that schema lacked
//! and backfills them before applying V1.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_jobs",
    sql: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            subject_name TEXT,
            upload_name TEXT NOT NULL,
            upload_path TEXT NOT NULL,
            reports_dir TEXT,
            storage_key TEXT,
            error TEXT,
            error_kind TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            request_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
    "#,
}];

/// Columns the legacy `jobs` table did not have.
const LEGACY_MISSING_COLUMNS: &[&str] = &["storage_key", "error_kind", "request_id"];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    if current_version == 0 && legacy_jobs_table_exists(conn).await? {
        upgrade_legacy_jobs(conn).await?;
        tracing::info!("Legacy jobs table detected, added missing columns");
    }

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Bring a pre-migration `jobs` table up to the V1 shape.
///
/// Completed rows get the key the local artifact store would have issued;
/// the old archives were never copied into it, so downloads report the
/// artifact as gone rather than pointing at an unmanaged path.
async fn upgrade_legacy_jobs(conn: &Connection) -> Result<(), DatabaseError> {
    for column in LEGACY_MISSING_COLUMNS {
        // Idempotent: fails harmlessly when the column already exists.
        let _ = conn
            .execute(&format!("ALTER TABLE jobs ADD COLUMN {column} TEXT"), ())
            .await;
    }

    conn.execute_batch(
        "UPDATE jobs SET storage_key = 'local:' || id || '.zip'
             WHERE status = 'completed' AND storage_key IS NULL;
         UPDATE jobs SET error_kind = 'analysis'
             WHERE status = 'failed' AND error_kind IS NULL;
         UPDATE jobs SET error = 'failed' WHERE status = 'failed' AND error IS NULL;",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to backfill legacy jobs: {e}")))?;
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Check if a `jobs` table already exists.
async fn legacy_jobs_table_exists(conn: &Connection) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check legacy tables: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read legacy check: {e}")))?;

    match row {
        Some(row) => {
            let count: i64 = row.get(0).unwrap_or(0);
            Ok(count > 0)
        }
        None => Ok(false),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
