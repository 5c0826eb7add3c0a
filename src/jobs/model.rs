//! Job record and state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::StorageKey;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker to claim it.
    Queued,
    /// Claimed by exactly one worker.
    Processing,
    /// Reports packaged and stored.
    Completed,
    /// The analysis or finalization failed.
    Failed,
}

impl JobStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The analysis executor returned an error or panicked.
    Analysis,
    /// Reports could not be packaged (none produced, unreadable files).
    Packaging,
    /// The artifact store rejected the packaged blob.
    Storage,
    /// Queue-side failure (working directory, bookkeeping).
    Internal,
}

impl FailureKind {
    /// Whether the same input could plausibly succeed on another attempt.
    ///
    /// Nothing requeues automatically; this only informs operators.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage | Self::Internal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Packaging => "packaging",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "packaging" => Ok(Self::Packaging),
            "storage" => Ok(Self::Storage),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// A failure recorded on a job: machine-readable kind plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            message: if message.trim().is_empty() {
                format!("{kind} failure")
            } else {
                message
            },
        }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Analysis, message)
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Snapshot of a persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub subject_name: Option<String>,
    /// Original file name as supplied by the producer.
    pub upload_name: String,
    /// Queue-owned copy of the upload.
    pub upload_path: PathBuf,
    /// Working directory handed to the executor, set at processing start.
    pub reports_dir: Option<PathBuf>,
    /// Present iff `status == Completed`.
    pub storage_key: Option<StorageKey>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    /// Present iff `status == Failed`.
    pub error_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Correlation id supplied by the producer.
    pub request_id: Option<String>,
}

impl Job {
    /// Build a fresh `queued` job for an upload already written to `upload_path`.
    pub fn new_queued(
        id: Uuid,
        upload_name: impl Into<String>,
        upload_path: impl Into<PathBuf>,
        subject_name: Option<String>,
        request_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            subject_name,
            upload_name: upload_name.into(),
            upload_path: upload_path.into(),
            reports_dir: None,
            storage_key: None,
            error: None,
            error_kind: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            request_id,
        }
    }

    /// The recorded failure, if the job failed.
    pub fn failure(&self) -> Option<JobFailure> {
        match (self.error_kind, &self.error) {
            (Some(kind), Some(message)) => Some(JobFailure {
                kind,
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// Whether the row is old enough to be past `ttl` at `now`.
    pub fn is_older_than(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl));
        match cutoff {
            Some(cutoff) => self.created_at <= cutoff,
            None => false,
        }
    }
}

/// Non-lifecycle fields a caller may change on an existing job.
///
/// `None` leaves a field untouched. Status, error and storage key move only
/// through claim / complete / fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub subject_name: Option<String>,
    pub reports_dir: Option<PathBuf>,
    pub request_id: Option<String>,
}
