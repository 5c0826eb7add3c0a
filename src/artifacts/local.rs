//! Filesystem-backed artifact store.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ArtifactStore, StorageKey};
use crate::error::ArtifactError;

const KEY_PREFIX: &str = "local:";

/// Stores one archive per job under a root directory.
///
/// Blobs are copied to a hidden partial file and renamed into place, so a
/// key is only ever handed out for a complete file.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Open (or create) the artifact root.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ArtifactError::io(&root, e))?;
        info!(root = %root.display(), "Artifact store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key back to its file, rejecting anything that could escape the root.
    fn resolve(&self, key: &StorageKey) -> Result<PathBuf, ArtifactError> {
        let name = key
            .as_str()
            .strip_prefix(KEY_PREFIX)
            .ok_or_else(|| ArtifactError::InvalidKey(key.to_string()))?;

        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !name.contains('\\') => {
                Ok(self.root.join(name))
            }
            _ => Err(ArtifactError::InvalidKey(key.to_string())),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, job_id: Uuid, blob: &Path) -> Result<StorageKey, ArtifactError> {
        let file_name = format!("{job_id}.zip");
        let final_path = self.root.join(&file_name);
        let partial_path = self.root.join(format!(".{file_name}.partial"));

        tokio::fs::copy(blob, &partial_path)
            .await
            .map_err(|e| ArtifactError::io(blob, e))?;
        if let Err(e) = tokio::fs::rename(&partial_path, &final_path).await {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(ArtifactError::io(&final_path, e));
        }

        let key = StorageKey::new(format!("{KEY_PREFIX}{file_name}"));
        debug!(job_id = %job_id, key = %key, "Artifact stored");
        Ok(key)
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<PathBuf>, ArtifactError> {
        let path = self.resolve(key)?;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Some(path)),
            Ok(false) => Ok(None),
            Err(e) => Err(ArtifactError::io(&path, e)),
        }
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, ArtifactError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Artifact deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArtifactError::io(&path, e)),
        }
    }
}
