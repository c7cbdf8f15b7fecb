use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{DirEntry, EntryKind, StorageBackend, StorageError, StorageFile, WriteMode};

/// Local filesystem backend rooted at a base directory.
///
/// Also usable for the staging area of a transcode job; remote object
/// stores implement the same trait behind their own crate.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalStorage {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Absolute location of a backend-relative path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_path.join(path)
    }
}

pub struct LocalFile {
    inner: fs::File,
}

#[async_trait::async_trait]
impl StorageFile for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        Ok(self.inner.read(buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        Ok(self.inner.write_all(buf).await?)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        Ok(self.inner.seek(pos).await?)
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        Ok(self.inner.flush().await?)
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalStorage {
    async fn open_read(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError> {
        let full = self.resolve(path);
        let inner = fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        Ok(Box::new(LocalFile { inner }))
    }

    async fn open_write(
        &self,
        path: &Path,
        mode: WriteMode,
    ) -> Result<Box<dyn StorageFile>, StorageError> {
        let full = self.resolve(path);
        let mut opts = fs::OpenOptions::new();
        opts.write(true);
        match mode {
            WriteMode::Create => opts.create(true),
            WriteMode::Truncate => opts.create(true).truncate(true),
            WriteMode::CreateNew => opts.create_new(true),
        };
        let inner = opts
            .open(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        Ok(Box::new(LocalFile { inner }))
    }

    async fn mkdir_p(&self, path: &Path, allow_exists: bool) -> Result<(), StorageError> {
        let full = self.resolve(path);
        if !allow_exists {
            match fs::metadata(&full).await {
                Ok(_) => return Err(StorageError::AlreadyExists(full)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::from_io(e, &full)),
            }
        }
        fs::create_dir_all(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))
    }

    async fn rmdir(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path);
        fs::remove_dir(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))
    }

    async fn scandir(&self, path: &Path) -> Result<Vec<DirEntry>, StorageError> {
        let full = self.resolve(path);
        let mut reader = fs::read_dir(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, &full))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::from_io(e, &full))?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        debug!(path = %full.display(), count = entries.len(), "scandir");
        Ok(entries)
    }

    async fn rename(&self, old: &Path, new: &Path) -> Result<(), StorageError> {
        let old_full = self.resolve(old);
        let new_full = self.resolve(new);
        fs::rename(&old_full, &new_full)
            .await
            .map_err(|e| StorageError::from_io(e, &old_full))
    }

    async fn unlink(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path);
        fs::remove_file(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let full = self.resolve(path);
        match fs::metadata(&full).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(e, &full)),
        }
    }

    async fn size(&self, path: &Path) -> Result<u64, StorageError> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mkdir_p_creates_all_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path());
        storage
            .mkdir_p(Path::new("a/b/c"), false)
            .await
            .unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());

        // second call without allow_exists is rejected
        let err = storage.mkdir_p(Path::new("a/b/c"), false).await;
        assert!(matches!(err, Err(StorageError::AlreadyExists(_))));
        storage.mkdir_p(Path::new("a/b/c"), true).await.unwrap();
    }

    #[tokio::test]
    async fn create_new_refuses_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let mut f = storage
            .open_write(Path::new("seg"), WriteMode::CreateNew)
            .await
            .unwrap();
        f.write_all(b"abc").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let err = storage
            .open_write(Path::new("seg"), WriteMode::CreateNew)
            .await;
        assert!(matches!(err, Err(StorageError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn scandir_reports_entry_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path());
        storage.mkdir_p(Path::new("d/sub"), true).await.unwrap();
        let mut f = storage
            .open_write(Path::new("d/file"), WriteMode::Truncate)
            .await
            .unwrap();
        f.write_all(b"x").await.unwrap();
        f.flush().await.unwrap();
        drop(f);

        let mut entries = storage.scandir(Path::new("d")).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[1].kind, EntryKind::Dir);
    }

    #[tokio::test]
    async fn read_not_found_is_refined() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(tmp.path());
        let err = storage.open_read(Path::new("missing")).await;
        assert!(matches!(err, Err(StorageError::NotFound(_))));
        assert!(!storage.exists(Path::new("missing")).await.unwrap());
    }
}
