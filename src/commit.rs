//! Staged commit manager.
//!
//! Publishes a just-transcoded version directory and retires any previous
//! version of the same label through the three status folders:
//!
//! - `transcoding/<v>` — staging area written during the job
//! - `committed/<v>`   — the published artifact readers see
//! - `discarding/<v>`  — tombstoned artifact awaiting removal
//!
//! The update path performs two renames that are not transactional on
//! arbitrary backends; the destination storage must provide atomic directory
//! rename. If the second rename fails the resource is left with
//! `discarding/<v>` present and no `committed/<v>` until a retry re-stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::rpc::ResourceKey;
use crate::storage::{EntryKind, StorageBackend, StorageError, WriteMode};
use crate::transfer::TransferredFiles;

pub const TRANSCODING_DIR: &str = "transcoding";
pub const COMMITTED_DIR: &str = "committed";
pub const DISCARDING_DIR: &str = "discarding";

/// Commit payload published next to a version's files
pub const VERSION_METADATA_FILENAME: &str = "transcoded.json";

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("failed to prepare status folders: {0}")]
    Prepare(StorageError),
    #[error("failed to move committed version to discarding folder: {0}")]
    Retire(StorageError),
    #[error("failed to move transcoding version to committed folder: {0}")]
    Promote(StorageError),
    #[error("failed to remove folder contents: {0}")]
    Remove(StorageError),
    #[error("version metadata error: {0}")]
    Metadata(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-format hook invoked while discarding, so a processor can delete the
/// artifacts it owns inside a version directory (segments, sidecars).
#[async_trait::async_trait]
pub trait VersionRemover: Send + Sync {
    async fn remove_version(
        &self,
        storage: &Arc<dyn StorageBackend>,
        version_dir: &Path,
        status: &str,
    ) -> Result<(), CommitError>;
}

/// Default remover: recursive unlink + rmdir, no format knowledge
pub struct RecursiveRemover;

#[async_trait::async_trait]
impl VersionRemover for RecursiveRemover {
    async fn remove_version(
        &self,
        storage: &Arc<dyn StorageBackend>,
        version_dir: &Path,
        _status: &str,
    ) -> Result<(), CommitError> {
        remove_dir_recursive(storage, version_dir).await
    }
}

/// Remove a directory tree: scandir, unlink every file, recurse into
/// subdirectories, rmdir the parent. The first unlink failure aborts.
pub async fn remove_dir_recursive(
    storage: &Arc<dyn StorageBackend>,
    path: &Path,
) -> Result<(), CommitError> {
    let entries = storage.scandir(path).await.map_err(CommitError::Remove)?;
    for entry in entries {
        let child = path.join(&entry.name);
        match entry.kind {
            EntryKind::Dir => Box::pin(remove_dir_recursive(storage, &child)).await?,
            _ => storage.unlink(&child).await.map_err(CommitError::Remove)?,
        }
    }
    storage.rmdir(path).await.map_err(CommitError::Remove)
}

/// Version publish/retire protocol for one destination storage
#[derive(Clone)]
pub struct CommitManager {
    storage: Arc<dyn StorageBackend>,
}

impl CommitManager {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        CommitManager { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn resource_dir(key: &ResourceKey) -> PathBuf {
        PathBuf::from(key.dir_name())
    }

    pub fn version_dir(key: &ResourceKey, status: &str, version: &str) -> PathBuf {
        Self::resource_dir(key).join(status).join(version)
    }

    /// Publish `transcoding/<version>`.
    ///
    /// With `version_exists` the previously committed directory is retired to
    /// `discarding/<version>` first (update protocol); otherwise the fresh
    /// protocol performs a single rename.
    pub async fn publish_version(
        &self,
        key: &ResourceKey,
        version: &str,
        version_exists: bool,
    ) -> Result<(), CommitError> {
        let resource = Self::resource_dir(key);
        self.storage
            .mkdir_p(&resource, true)
            .await
            .map_err(CommitError::Prepare)?;
        self.storage
            .mkdir_p(&resource.join(DISCARDING_DIR), true)
            .await
            .map_err(CommitError::Prepare)?;
        self.storage
            .mkdir_p(&resource.join(COMMITTED_DIR), true)
            .await
            .map_err(CommitError::Prepare)?;

        if version_exists {
            self.storage
                .rename(
                    &Self::version_dir(key, COMMITTED_DIR, version),
                    &Self::version_dir(key, DISCARDING_DIR, version),
                )
                .await
                .map_err(CommitError::Retire)?;
        }
        self.storage
            .rename(
                &Self::version_dir(key, TRANSCODING_DIR, version),
                &Self::version_dir(key, COMMITTED_DIR, version),
            )
            .await
            .map_err(CommitError::Promote)?;
        debug!(version, update = version_exists, "version published");
        Ok(())
    }

    /// Write the commit payload into the staging directory before publish
    pub async fn write_version_metadata(
        &self,
        key: &ResourceKey,
        version: &str,
        files: &TransferredFiles,
    ) -> Result<(), CommitError> {
        let path =
            Self::version_dir(key, TRANSCODING_DIR, version).join(VERSION_METADATA_FILENAME);
        let body = serde_json::to_vec(&files.to_json())
            .map_err(|e| CommitError::Metadata(e.to_string()))?;
        let mut file = self.storage.open_write(&path, WriteMode::Truncate).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the commit payload of a published version, if any
    pub async fn read_version_metadata(
        &self,
        key: &ResourceKey,
        version: &str,
    ) -> Result<Option<TransferredFiles>, CommitError> {
        let path = Self::version_dir(key, COMMITTED_DIR, version).join(VERSION_METADATA_FILENAME);
        let mut file = match self.storage.open_read(&path).await {
            Ok(f) => f,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut body = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let nread = file.read(&mut buf).await?;
            if nread == 0 {
                break;
            }
            body.extend_from_slice(&buf[..nread]);
        }
        let value: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| CommitError::Metadata(e.to_string()))?;
        let files = TransferredFiles::from_json(&value)
            .map_err(|e| CommitError::Metadata(e.to_string()))?;
        Ok(Some(files))
    }

    /// Remove everything a resource owns under the status folders.
    ///
    /// Walks `transcoding`, `discarding`, `committed` in that order; each
    /// version directory found is handed to the per-format remover, then the
    /// status folder itself is removed.
    pub async fn discard_resource(
        &self,
        key: &ResourceKey,
        remover: &dyn VersionRemover,
    ) -> Result<(), CommitError> {
        let resource = Self::resource_dir(key);
        for status in [TRANSCODING_DIR, DISCARDING_DIR, COMMITTED_DIR] {
            let status_dir = resource.join(status);
            let entries = match self.storage.scandir(&status_dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(CommitError::Remove(e)),
            };
            for entry in entries {
                let child = status_dir.join(&entry.name);
                match entry.kind {
                    EntryKind::Dir => {
                        remover
                            .remove_version(&self.storage, &child, status)
                            .await?
                    }
                    _ => self
                        .storage
                        .unlink(&child)
                        .await
                        .map_err(CommitError::Remove)?,
                }
            }
            self.storage
                .rmdir(&status_dir)
                .await
                .map_err(CommitError::Remove)?;
            debug!(status, "status folder discarded");
        }
        // drop the now-empty resource dir as well; source chunks may still
        // live here, so tolerate failure
        if let Err(e) = self.storage.rmdir(&resource).await {
            if !e.is_not_found() {
                warn!(resource = %resource.display(), error = %e, "resource dir left in place");
            }
        }
        Ok(())
    }
}
