//! `JobStore` trait, the single async interface for job persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::artifacts::StorageKey;
use crate::error::DatabaseError;
use crate::jobs::{Job, JobFailure, JobUpdate};

/// Backend-agnostic durable job table.
///
/// Only [`JobStore::claim_next_job`] needs mutual exclusion; every other
/// operation touches a single row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create tables and indexes if they do not exist.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Insert a new job row.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Update non-lifecycle fields. Always stamps `updated_at`.
    /// Returns `false` if the job does not exist.
    async fn update_job(&self, id: Uuid, update: &JobUpdate) -> Result<bool, DatabaseError>;

    /// Most recently created jobs first, up to `limit`.
    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// Every job, oldest first. Used by the reaper.
    async fn list_all_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Atomically move the oldest `queued` job to `processing`.
    ///
    /// Under any number of concurrent callers each job is returned to at
    /// most one of them. `None` means nothing is queued.
    async fn claim_next_job(&self) -> Result<Option<Job>, DatabaseError>;

    /// `processing` → `completed`. Returns `false` if the job was not processing.
    async fn complete_job(&self, id: Uuid, storage_key: &StorageKey)
    -> Result<bool, DatabaseError>;

    /// `processing` → `failed`. Returns `false` if the job was not processing.
    async fn fail_job(&self, id: Uuid, failure: &JobFailure) -> Result<bool, DatabaseError>;

    /// Delete a job row unless it is currently `processing`.
    /// Returns `true` if a row was removed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
