//! libSQL backend: async `JobStore` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-precision RFC 3339 strings so `ORDER BY created_at` is chronological.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::StorageKey;
use crate::error::DatabaseError;
use crate::jobs::{FailureKind, Job, JobFailure, JobStatus, JobUpdate};
use crate::store::migrations;
use crate::store::traits::JobStore;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Other worker processes may hold the write lock briefly.
        if let Err(e) = conn.query("PRAGMA busy_timeout = 5000", ()).await {
            warn!(error = %e, "Failed to set busy_timeout; concurrent writers may see SQLITE_BUSY");
        }

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Job database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Oldest queued job id, insertion order breaking timestamp ties.
    async fn next_queued_id(&self) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC LIMIT 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next_job select: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("claim_next_job id: {e}")))?;
                Ok(Some(id))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next_job select: {e}"))),
        }
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op} row: {e}"))),
            }
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: RFC 3339, microseconds, `Z` suffix.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_text = |idx: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("job.{name}: {e}")))
    };
    let get_opt = |idx: i32| -> Option<String> { row.get::<String>(idx).ok() };

    let id_str = get_text(0, "id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id {id_str:?}: {e}")))?;
    let status: JobStatus = get_text(1, "status")?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let error_kind = get_opt(8)
        .map(|s| s.parse::<FailureKind>())
        .transpose()
        .map_err(DatabaseError::Serialization)?;

    Ok(Job {
        id,
        status,
        subject_name: get_opt(2),
        upload_name: get_text(3, "upload_name")?,
        upload_path: PathBuf::from(get_text(4, "upload_path")?),
        reports_dir: get_opt(5).map(PathBuf::from),
        storage_key: get_opt(6).map(StorageKey::new),
        error: get_opt(7),
        error_kind,
        created_at: parse_datetime(&get_text(9, "created_at")?),
        updated_at: parse_datetime(&get_text(10, "updated_at")?),
        started_at: parse_optional_datetime(&get_opt(11)),
        completed_at: parse_optional_datetime(&get_opt(12)),
        request_id: get_opt(13),
    })
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, status, subject_name, upload_name, upload_path, reports_dir, storage_key, error, error_kind, created_at, updated_at, started_at, completed_at, request_id";

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    job.id.to_string(),
                    job.status.as_str(),
                    job.subject_name.clone(),
                    job.upload_name.as_str(),
                    path_text(&job.upload_path),
                    job.reports_dir.as_deref().map(path_text),
                    job.storage_key.as_ref().map(|k| k.as_str().to_string()),
                    job.error.clone(),
                    job.error_kind.map(|k| k.as_str()),
                    timestamp(job.created_at),
                    timestamp(job.updated_at),
                    job.started_at.map(timestamp),
                    job.completed_at.map(timestamp),
                    job.request_id.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, status = %job.status, "Job inserted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> Result<bool, DatabaseError> {
        let now = timestamp(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET
                    subject_name = COALESCE(?1, subject_name),
                    reports_dir = COALESCE(?2, reports_dir),
                    request_id = COALESCE(?3, request_id),
                    updated_at = ?4
                 WHERE id = ?5",
                params![
                    update.subject_name.clone(),
                    update.reports_dir.as_deref().map(path_text),
                    update.request_id.clone(),
                    now,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        debug!(job_id = %id, found = count > 0, "Job updated");
        Ok(count > 0)
    }

    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_recent_jobs",
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1"),
            params![limit as i64],
        )
        .await
    }

    async fn list_all_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_all_jobs",
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, rowid ASC"),
            (),
        )
        .await
    }

    async fn claim_next_job(&self) -> Result<Option<Job>, DatabaseError> {
        // Compare-and-set on status: a losing racer sees 0 changed rows and
        // moves on to the next candidate. Each retry means another caller won.
        loop {
            let Some(id) = self.next_queued_id().await? else {
                return Ok(None);
            };

            let now = timestamp(Utc::now());
            let changed = self
                .conn()
                .execute(
                    "UPDATE jobs SET status = 'processing', started_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND status = 'queued'",
                    params![now, id.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_next_job update: {e}")))?;

            if changed == 0 {
                debug!(job_id = %id, "Lost claim race, retrying");
                continue;
            }

            let mut claimed = self
                .query_jobs(
                    "claim_next_job snapshot",
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    params![id.as_str()],
                )
                .await?;
            match claimed.pop() {
                Some(job) => {
                    debug!(job_id = %job.id, "Job claimed");
                    return Ok(Some(job));
                }
                // Deleted between the update and the read.
                None => continue,
            }
        }
    }

    async fn complete_job(
        &self,
        id: Uuid,
        storage_key: &StorageKey,
    ) -> Result<bool, DatabaseError> {
        let now = timestamp(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'completed', storage_key = ?1, error = NULL,
                    error_kind = NULL, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing'",
                params![storage_key.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        debug!(job_id = %id, transitioned = count > 0, "Job completion recorded");
        Ok(count > 0)
    }

    async fn fail_job(&self, id: Uuid, failure: &JobFailure) -> Result<bool, DatabaseError> {
        let now = timestamp(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'failed', storage_key = NULL, error = ?1,
                    error_kind = ?2, completed_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![
                    failure.message.as_str(),
                    failure.kind.as_str(),
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;

        debug!(job_id = %id, transitioned = count > 0, "Job failure recorded");
        Ok(count > 0)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND status != 'processing'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::SubsecRound;

    use super::*;

    async fn test_db() -> LibSqlJobStore {
        LibSqlJobStore::new_memory().await.unwrap()
    }

    fn make_job(name: &str) -> Job {
        let id = Uuid::new_v4();
        Job::new_queued(
            id,
            name,
            format!("/tmp/uploads/{id}.txt"),
            Some("Test Subject".to_string()),
            Some("req-1".to_string()),
        )
    }

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let db = test_db().await;
        let job = make_job("AncestryDNA.txt");
        db.insert_job(&job).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.upload_name, "AncestryDNA.txt");
        assert_eq!(fetched.subject_name.as_deref(), Some("Test Subject"));
        assert_eq!(fetched.request_id.as_deref(), Some("req-1"));
        assert!(fetched.storage_key.is_none());
        assert!(fetched.error.is_none());
        assert_eq!(fetched.created_at, job.created_at.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn get_by_id_not_found() {
        let db = test_db().await;
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_stamps_updated_at_and_keeps_other_fields() {
        let db = test_db().await;
        let mut job = make_job("a.txt");
        job.updated_at = Utc::now() - chrono::Duration::hours(1);
        db.insert_job(&job).await.unwrap();

        let update = JobUpdate {
            reports_dir: Some(PathBuf::from("/tmp/reports/x")),
            ..Default::default()
        };
        assert!(db.update_job(job.id, &update).await.unwrap());

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.reports_dir, Some(PathBuf::from("/tmp/reports/x")));
        assert_eq!(fetched.subject_name.as_deref(), Some("Test Subject"));
        assert!(fetched.updated_at > job.updated_at);

        assert!(!db.update_job(Uuid::new_v4(), &update).await.unwrap());
    }

    #[tokio::test]
    async fn list_recent_is_newest_first_and_limited() {
        let db = test_db().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let job = make_job(&format!("{i}.txt"));
            ids.push(job.id);
            db.insert_job(&job).await.unwrap();
        }

        let recent = db.list_recent_jobs(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, ids[2]);
        assert_eq!(recent[1].id, ids[1]);
    }

    #[tokio::test]
    async fn claim_is_fifo() {
        let db = test_db().await;
        let jobs: Vec<Job> = ["a.txt", "b.txt", "c.txt"].iter().map(|n| make_job(n)).collect();
        for job in &jobs {
            db.insert_job(job).await.unwrap();
        }

        for expected in &jobs {
            let claimed = db.claim_next_job().await.unwrap().unwrap();
            assert_eq!(claimed.id, expected.id);
            assert_eq!(claimed.status, JobStatus::Processing);
            assert!(claimed.started_at.is_some());
        }
        assert!(db.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_ties_break_by_insertion_order() {
        let db = test_db().await;
        let created = Utc::now();
        let mut ids = Vec::new();
        for name in ["first.txt", "second.txt", "third.txt"] {
            let mut job = make_job(name);
            job.created_at = created;
            ids.push(job.id);
            db.insert_job(&job).await.unwrap();
        }

        for id in ids {
            assert_eq!(db.claim_next_job().await.unwrap().unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn claim_on_empty_store_is_none() {
        let db = test_db().await;
        assert!(db.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_one_job_once() {
        let db = Arc::new(test_db().await);
        let job = make_job("only.txt");
        db.insert_job(&job).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let db = Arc::clone(&db);
                tokio::spawn(async move { db.claim_next_job().await.unwrap() })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                winners.push(job.id);
            }
        }
        assert_eq!(winners, vec![job.id]);
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let db = test_db().await;
        let job = make_job("a.txt");
        db.insert_job(&job).await.unwrap();
        let key = StorageKey::new("local:x.zip");

        // Still queued: not allowed.
        assert!(!db.complete_job(job.id, &key).await.unwrap());

        db.claim_next_job().await.unwrap().unwrap();
        assert!(db.complete_job(job.id, &key).await.unwrap());

        let done = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.storage_key, Some(key.clone()));
        assert!(done.completed_at.is_some());
        assert!(done.error.is_none());

        // Terminal: neither transition applies again.
        assert!(!db.fail_job(job.id, &JobFailure::analysis("late")).await.unwrap());
        assert!(!db.complete_job(job.id, &key).await.unwrap());
        let again = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(again.completed_at, done.completed_at);
    }

    #[tokio::test]
    async fn fail_records_kind_and_message() {
        let db = test_db().await;
        let job = make_job("a.txt");
        db.insert_job(&job).await.unwrap();
        db.claim_next_job().await.unwrap().unwrap();

        let failure = JobFailure::new(FailureKind::Packaging, "No reports were generated");
        assert!(db.fail_job(job.id, &failure).await.unwrap());

        let failed = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.failure(), Some(failure));
        assert!(failed.storage_key.is_none());
    }

    #[tokio::test]
    async fn delete_skips_processing_rows() {
        let db = test_db().await;
        let claimed = make_job("p.txt");
        let queued = make_job("q.txt");
        db.insert_job(&claimed).await.unwrap();
        db.insert_job(&queued).await.unwrap();
        assert_eq!(db.claim_next_job().await.unwrap().unwrap().id, claimed.id);

        assert!(!db.delete_job(claimed.id).await.unwrap());
        assert!(db.delete_job(queued.id).await.unwrap());
        assert!(db.get_job(claimed.id).await.unwrap().is_some());
        assert!(db.get_job(queued.id).await.unwrap().is_none());
        assert_eq!(db.list_all_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("jobs.sqlite3");
        let job = make_job("a.txt");
        {
            let db = LibSqlJobStore::new_local(&path).await.unwrap();
            db.insert_job(&job).await.unwrap();
        }
        let db = LibSqlJobStore::new_local(&path).await.unwrap();
        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Queued);
    }
}
