//! Uniform async storage vocabulary over local and remote backends.
//!
//! Every component above this layer (transfer engine, commit manager,
//! orchestrator) talks to an [`Arc<dyn StorageBackend>`] and never touches a
//! concrete filesystem API. Paths are relative to the backend's root.

mod localfs;
mod mem;

pub use localfs::LocalStorage;
pub use mem::MemStorage;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data error: {0}")]
    Data(String),
    #[error("end of scan")]
    EndOfScan,
    #[error("storage error: {0}")]
    Unknown(String),
}

impl StorageError {
    /// Map an io::Error to the refined variants the commit/cache layers
    /// branch on, keeping the path for diagnostics.
    pub(crate) fn from_io(err: std::io::Error, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_path_buf()),
            _ => StorageError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// One entry returned by [`StorageBackend::scandir`]
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// How [`StorageBackend::open_write`] treats an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create if missing, keep existing contents (cache layer truncates
    /// explicitly after it holds the write lock)
    Create,
    /// Create if missing, drop existing contents
    Truncate,
    /// Fail with `AlreadyExists` when the file is present
    CreateNew,
}

/// An open file on some storage backend
#[async_trait::async_trait]
pub trait StorageFile: Send {
    /// Read up to `buf.len()` bytes at the current position. Returns 0 at EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError>;
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError>;
    async fn flush(&mut self) -> Result<(), StorageError>;
}

/// Alias → backend map the job layer resolves `storage_alias` fields
/// against. Backends register once at service startup.
#[derive(Default, Clone)]
pub struct StorageRegistry {
    backends: std::collections::HashMap<String, std::sync::Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, alias: impl Into<String>, backend: std::sync::Arc<dyn StorageBackend>) {
        self.backends.insert(alias.into(), backend);
    }

    pub fn get(&self, alias: &str) -> Option<std::sync::Arc<dyn StorageBackend>> {
        self.backends.get(alias).cloned()
    }
}

/// Async file/directory operations of one storage backend.
///
/// `mkdir_p` creates all missing parents. `scandir` returns the full entry
/// list in one call; callers wanting entry-at-a-time iteration walk the
/// vector. No operation panics; every failure is a [`StorageError`].
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn open_read(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError>;
    async fn open_write(
        &self,
        path: &Path,
        mode: WriteMode,
    ) -> Result<Box<dyn StorageFile>, StorageError>;
    async fn mkdir_p(&self, path: &Path, allow_exists: bool) -> Result<(), StorageError>;
    async fn rmdir(&self, path: &Path) -> Result<(), StorageError>;
    async fn scandir(&self, path: &Path) -> Result<Vec<DirEntry>, StorageError>;
    async fn rename(&self, old: &Path, new: &Path) -> Result<(), StorageError>;
    async fn unlink(&self, path: &Path) -> Result<(), StorageError>;
    async fn exists(&self, path: &Path) -> Result<bool, StorageError>;
    async fn size(&self, path: &Path) -> Result<u64, StorageError>;
}
