//! Producer-facing job queue: enqueue uploads, look jobs up, resolve downloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::error::{Error, JobError, Result, ValidationError};
use crate::jobs::model::{Job, JobStatus};
use crate::store::JobStore;

/// Upload extensions accepted for raw genome data.
pub const ALLOWED_EXTENSIONS: &[&str] = &[".txt", ".csv", ".tsv"];

/// Extension used when the upload name has none.
const DEFAULT_EXTENSION: &str = ".txt";

/// Producer entry point over a [`JobStore`] and an [`ArtifactStore`].
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    uploads_dir: PathBuf,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        uploads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            artifacts,
            uploads_dir: uploads_dir.into(),
        }
    }

    /// Persist an upload and create a `queued` job for it.
    ///
    /// The file is fully written before the row exists. If the write fails no
    /// row is created; if the insert fails the file is removed again.
    pub async fn enqueue(
        &self,
        upload_name: &str,
        bytes: &[u8],
        subject_name: Option<&str>,
        request_id: Option<&str>,
    ) -> Result<Uuid> {
        let upload_name = base_name(upload_name);
        let extension = validate_upload(&upload_name, bytes)?;

        let job_id = Uuid::new_v4();
        let upload_path = self.uploads_dir.join(format!("{job_id}{extension}"));

        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .map_err(|e| Error::io("creating uploads directory", &self.uploads_dir, e))?;
        tokio::fs::write(&upload_path, bytes)
            .await
            .map_err(|e| Error::io("writing upload", &upload_path, e))?;

        let job = Job::new_queued(
            job_id,
            upload_name,
            &upload_path,
            non_blank(subject_name),
            non_blank(request_id),
        );

        if let Err(e) = self.store.insert_job(&job).await {
            if let Err(cleanup) = tokio::fs::remove_file(&upload_path).await {
                warn!(job_id = %job_id, error = %cleanup, "Failed to remove upload after insert error");
            }
            return Err(e.into());
        }

        info!(
            job_id = %job_id,
            upload = %job.upload_name,
            bytes = bytes.len(),
            request_id = job.request_id.as_deref().unwrap_or("-"),
            "Job enqueued"
        );
        Ok(job_id)
    }

    /// Current snapshot of a job, or `None` if the id is unknown.
    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id).await?)
    }

    /// Most recent jobs, newest first. For observability only.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Job>> {
        Ok(self.store.list_recent_jobs(limit).await?)
    }

    /// Resolve the packaged reports of a completed job to a readable path.
    ///
    /// Unknown ids, unfinished jobs and purged artifacts are three distinct
    /// errors: `NotFound`, `NotReady` and `StorageGone`.
    pub async fn download(&self, job_id: Uuid) -> Result<PathBuf> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        let key = match (job.status, job.storage_key) {
            (JobStatus::Completed, Some(key)) => key,
            (status, _) => return Err(JobError::NotReady { id: job_id, status }.into()),
        };

        match self.artifacts.get(&key).await? {
            Some(path) => Ok(path),
            None => Err(JobError::StorageGone { id: job_id }.into()),
        }
    }
}

/// Check an upload before anything touches disk. Returns the stored extension.
fn validate_upload(upload_name: &str, bytes: &[u8]) -> std::result::Result<String, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyUpload {
            name: upload_name.to_string(),
        });
    }

    let extension = match Path::new(upload_name).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy().to_lowercase()),
        None => DEFAULT_EXTENSION.to_string(),
    };
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ValidationError::UnsupportedExtension {
            name: upload_name.to_string(),
            extension,
            allowed: ALLOWED_EXTENSIONS.join(", "),
        });
    }
    Ok(extension)
}

/// Strip any client-supplied directories from an upload name.
fn base_name(upload_name: &str) -> String {
    let trimmed = upload_name.trim();
    let name = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .trim();
    if name.is_empty() {
        format!("upload{DEFAULT_EXTENSION}")
    } else {
        name.to_string()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
