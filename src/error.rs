//! Error types for the genome job queue.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobStatus;

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("I/O error while {action} {}: {source}", path.display())]
    TransientIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::TransientIo {
            action,
            path: path.into(),
            source,
        }
    }

    /// Machine-readable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Database(_) => ErrorKind::Database,
            Self::Artifact(ArtifactError::Io { .. }) => ErrorKind::TransientIo,
            Self::Artifact(_) => ErrorKind::Storage,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Job(JobError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Job(JobError::NotReady { .. }) => ErrorKind::NotReady,
            Self::Job(JobError::StorageGone { .. }) => ErrorKind::StorageGone,
            Self::TransientIo { .. } => ErrorKind::TransientIo,
        }
    }
}

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Database,
    Storage,
    Validation,
    NotFound,
    NotReady,
    StorageGone,
    TransientIo,
}

impl ErrorKind {
    /// Whether repeating the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::TransientIo | Self::NotReady)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Artifact storage and packaging errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Packaging failed: {0}")]
    Packaging(String),

    #[error("No reports were generated in {}", .0.display())]
    NoReports(PathBuf),
}

impl ArtifactError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Producer-side rejections. No job row ever exists for these.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Upload {name} is empty")]
    EmptyUpload { name: String },

    #[error("Unsupported upload type {extension:?} for {name}; expected one of {allowed}")]
    UnsupportedExtension {
        name: String,
        extension: String,
        allowed: String,
    },
}

/// Job lookup and download errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {status}, results are not ready")]
    NotReady { id: Uuid, status: JobStatus },

    #[error("Results for job {id} are no longer available")]
    StorageGone { id: Uuid },
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
