//! Artifact storage: the durable home for each completed job's packaged reports.
//!
//! Callers only ever see an opaque [`StorageKey`]. The local backend maps
//! keys onto files under an artifacts root; a networked backend can replace
//! it behind the same [`ArtifactStore`] trait.

pub mod local;
pub mod package;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ArtifactError;

pub use local::LocalArtifactStore;
pub use package::{REPORT_NAMES, archive_entries, package_reports};

/// Opaque handle to a stored artifact. Never assume it is a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-agnostic artifact store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist a durable copy of `blob` for `job_id` and return its key.
    async fn put(&self, job_id: Uuid, blob: &Path) -> Result<StorageKey, ArtifactError>;

    /// Resolve a key to a readable local path. `None` means the artifact was purged.
    async fn get(&self, key: &StorageKey) -> Result<Option<PathBuf>, ArtifactError>;

    /// Remove an artifact. Returns `false` if it was already gone.
    async fn delete(&self, key: &StorageKey) -> Result<bool, ArtifactError>;
}
