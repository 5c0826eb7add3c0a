//! Reaper: retention cleanup under three independent TTLs.
//!
//! - uploads: raw input files of finished jobs
//! - artifacts: stored report archives (the row keeps its storage key, so
//!   downloads report the results as gone)
//! - jobs: the rows themselves, with their upload, working directory and
//!   any artifact still stored
//!
//! Jobs in `processing` are never touched. A `queued` job keeps its upload
//! until its row is reaped, and the row delete is guarded against a
//! concurrent claim.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::config::Ttls;
use crate::error::Result;
use crate::jobs::JobStatus;
use crate::store::JobStore;

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_uploads: usize,
    pub removed_artifacts: usize,
    pub removed_jobs: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.removed_uploads == 0 && self.removed_artifacts == 0 && self.removed_jobs == 0
    }
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    /// Run one cleanup pass.
    ///
    /// Individual deletions that fail are logged and retried on the next
    /// pass; only failing to list jobs aborts the pass.
    pub async fn cleanup_expired_jobs(&self, ttls: &Ttls) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        for job in self.store.list_all_jobs().await? {
            if job.status == JobStatus::Processing {
                continue;
            }

            let row_expired = job.is_older_than(ttls.job, now);

            // A reaped row takes its artifact with it; nothing could reach the blob afterwards.
            if row_expired || job.is_older_than(ttls.artifact, now) {
                if let Some(key) = &job.storage_key {
                    match self.artifacts.delete(key).await {
                        Ok(true) => report.removed_artifacts += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(job_id = %job.id, storage_key = %key, error = %e, "Failed to delete artifact");
                            // Keep the row so the next pass can retry through its key.
                            continue;
                        }
                    }
                }
            }

            let row_removed = if row_expired {
                match self.store.delete_job(job.id).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Failed to delete job row");
                        false
                    }
                }
            } else {
                false
            };

            let upload_expired = job.status.is_terminal() && job.is_older_than(ttls.upload, now);
            if (upload_expired || row_removed) && remove_file(&job.upload_path).await {
                report.removed_uploads += 1;
            }

            if row_removed {
                report.removed_jobs += 1;
                if let Some(dir) = &job.reports_dir {
                    remove_dir(dir).await;
                    // Archives written beside the working directory by the previous service.
                    remove_file(&dir.with_extension("zip")).await;
                }
                debug!(job_id = %job.id, status = %job.status, "Job reaped");
            }
        }

        if !report.is_empty() {
            info!(
                removed_uploads = report.removed_uploads,
                removed_artifacts = report.removed_artifacts,
                removed_jobs = report.removed_jobs,
                "Cleanup pass finished"
            );
        }
        Ok(report)
    }
}

/// Spawn the periodic cleanup loop. The first pass runs immediately.
pub fn spawn_reaper_loop(reaper: Arc<Reaper>, ttls: Ttls, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reaper loop started (interval: {}s)", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = reaper.cleanup_expired_jobs(&ttls).await {
                error!(error = %e, "Cleanup pass failed");
            }
        }
    })
}

/// Returns `true` only if a file was actually removed.
async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove reports directory"),
    }
}
