//! Job worker: claim, analyze, package, store, record.
//!
//! Every per-job failure ends up on the job row. Only errors talking to the
//! job store itself escape `process_next_job`, and the run loop logs those
//! and keeps polling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::{ArtifactStore, StorageKey, package_reports};
use crate::error::Result;
use crate::jobs::{FailureKind, Job, JobFailure, JobUpdate};
use crate::store::JobStore;
use crate::worker::executor::{AnalysisExecutor, join_error_message};

/// Processes queued jobs one at a time.
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    executor: Arc<dyn AnalysisExecutor>,
    reports_root: PathBuf,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        executor: Arc<dyn AnalysisExecutor>,
        reports_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            artifacts,
            executor,
            reports_root: reports_root.into(),
        }
    }

    /// Claim and fully process one job.
    ///
    /// Returns the job as recorded after processing, or `None` when nothing
    /// was queued.
    pub async fn process_next_job(&self) -> Result<Option<Job>> {
        let Some(job) = self.store.claim_next_job().await? else {
            return Ok(None);
        };

        let job_id = job.id;
        info!(
            job_id = %job_id,
            upload = %job.upload_name,
            request_id = job.request_id.as_deref().unwrap_or("-"),
            "Processing job"
        );

        let outcome = self.execute(&job).await;
        self.record_outcome(job_id, outcome).await;

        Ok(self.store.get_job(job_id).await?)
    }

    /// Poll forever. Sleeps `poll_interval` only when the queue was empty
    /// or the store could not be reached.
    pub async fn run(&self, poll_interval: Duration) {
        loop {
            match self.process_next_job().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "Worker poll failed"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn execute(&self, job: &Job) -> std::result::Result<StorageKey, JobFailure> {
        let reports_dir = self.reports_root.join(job.id.to_string());
        tokio::fs::create_dir_all(&reports_dir).await.map_err(|e| {
            JobFailure::new(
                FailureKind::Internal,
                format!("failed to create {}: {e}", reports_dir.display()),
            )
        })?;

        let update = JobUpdate {
            reports_dir: Some(reports_dir.clone()),
            ..JobUpdate::default()
        };
        self.store
            .update_job(job.id, &update)
            .await
            .map_err(|e| JobFailure::new(FailureKind::Internal, e.to_string()))?;

        self.analyze(job, &reports_dir).await?;

        let archive = self.reports_root.join(format!("{}.zip", job.id));
        let stored = match package(&reports_dir, &archive).await {
            Ok(entries) => {
                debug!(job_id = %job.id, entries = entries.len(), "Reports packaged");
                self.artifacts
                    .put(job.id, &archive)
                    .await
                    .map_err(|e| JobFailure::new(FailureKind::Storage, e.to_string()))
            }
            Err(failure) => Err(failure),
        };

        remove_temp_archive(job.id, &archive).await;
        stored
    }

    /// Run the executor on its own task so a panic becomes a failed job.
    async fn analyze(&self, job: &Job, reports_dir: &Path) -> std::result::Result<(), JobFailure> {
        let executor = Arc::clone(&self.executor);
        let input = job.upload_path.clone();
        let subject_name = job.subject_name.clone();
        let output_dir = reports_dir.to_path_buf();

        let handle = tokio::spawn(async move {
            executor
                .run(&input, subject_name.as_deref(), &output_dir)
                .await
        });

        match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(JobFailure::analysis(format!("{e:#}"))),
            Err(e) => Err(JobFailure::analysis(join_error_message(e))),
        }
    }

    async fn record_outcome(&self, job_id: Uuid, outcome: std::result::Result<StorageKey, JobFailure>) {
        let failure = match outcome {
            Ok(key) => match self.store.complete_job(job_id, &key).await {
                Ok(true) => {
                    info!(job_id = %job_id, storage_key = %key, "Job completed");
                    return;
                }
                Ok(false) => {
                    warn!(job_id = %job_id, "Job left processing before completion was recorded");
                    return;
                }
                Err(e) => JobFailure::new(
                    FailureKind::Internal,
                    format!("failed to record completion: {e}"),
                ),
            },
            Err(failure) => failure,
        };

        match self.store.fail_job(job_id, &failure).await {
            Ok(true) => warn!(
                job_id = %job_id,
                kind = %failure.kind,
                error = %failure.message,
                "Job failed"
            ),
            Ok(false) => warn!(job_id = %job_id, "Job left processing before failure was recorded"),
            Err(e) => error!(
                job_id = %job_id,
                error = %e,
                "Could not record job failure; job remains processing"
            ),
        }
    }
}

/// The archive only lives until the artifact store holds its own copy.
async fn remove_temp_archive(job_id: Uuid, archive: &Path) {
    match tokio::fs::remove_file(archive).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove temporary archive"),
    }
}

async fn package(reports_dir: &Path, archive: &Path) -> std::result::Result<Vec<String>, JobFailure> {
    let source = reports_dir.to_path_buf();
    let dest = archive.to_path_buf();
    tokio::task::spawn_blocking(move || package_reports(&source, &dest))
        .await
        .map_err(|e| JobFailure::new(FailureKind::Packaging, format!("packaging task failed: {e}")))?
        .map_err(|e| JobFailure::new(FailureKind::Packaging, e.to_string()))
}
