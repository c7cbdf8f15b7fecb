use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{DirEntry, EntryKind, StorageBackend, StorageError, StorageFile, WriteMode};

#[derive(Default)]
struct MemState {
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    dirs: HashSet<PathBuf>,
    fail_rename_to: Option<PathBuf>,
}

/// In-memory backend.
///
/// Backs tests that need a non-filesystem store, and doubles as the fault
/// harness for protocols whose failure windows are otherwise unreachable:
/// [`MemStorage::fail_next_rename_to`] makes exactly one rename onto the
/// given target fail.
#[derive(Clone, Default)]
pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
}

impl MemStorage {
    pub fn new() -> Self {
        let storage = MemStorage::default();
        storage.state.lock().unwrap().dirs.insert(PathBuf::new());
        storage
    }

    /// Arm a one-shot failure for the next rename whose destination is `to`
    pub fn fail_next_rename_to(&self, to: impl Into<PathBuf>) {
        self.state.lock().unwrap().fail_rename_to = Some(to.into());
    }

    /// Current contents of a file, if present
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path.as_ref())
            .map(|c| c.lock().unwrap().clone())
    }

    fn parent_exists(state: &MemState, path: &Path) -> bool {
        match path.parent() {
            Some(parent) => state.dirs.contains(parent),
            None => true,
        }
    }
}

struct MemFile {
    content: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

#[async_trait::async_trait]
impl StorageFile for MemFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let content = self.content.lock().unwrap();
        if self.pos >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - self.pos);
        buf[..n].copy_from_slice(&content[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        let mut content = self.content.lock().unwrap();
        let end = self.pos + buf.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let len = self.content.lock().unwrap().len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(off) => len + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if target < 0 {
            return Err(StorageError::Data("seek before start".to_string()));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }

    async fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemStorage {
    async fn open_read(&self, path: &Path) -> Result<Box<dyn StorageFile>, StorageError> {
        let state = self.state.lock().unwrap();
        let content = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))?;
        Ok(Box::new(MemFile { content, pos: 0 }))
    }

    async fn open_write(
        &self,
        path: &Path,
        mode: WriteMode,
    ) -> Result<Box<dyn StorageFile>, StorageError> {
        let mut state = self.state.lock().unwrap();
        if !Self::parent_exists(&state, path) {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        let exists = state.files.contains_key(path);
        if exists && mode == WriteMode::CreateNew {
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }
        let content = state
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        if mode == WriteMode::Truncate {
            content.lock().unwrap().clear();
        }
        Ok(Box::new(MemFile { content, pos: 0 }))
    }

    async fn mkdir_p(&self, path: &Path, allow_exists: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.dirs.contains(path) {
            if allow_exists {
                return Ok(());
            }
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        let occupied = state.files.keys().any(|f| f.starts_with(path))
            || state.dirs.iter().any(|d| d != path && d.starts_with(path));
        if occupied {
            return Err(StorageError::Data(format!(
                "directory not empty: {}",
                path.display()
            )));
        }
        state.dirs.remove(path);
        Ok(())
    }

    async fn scandir(&self, path: &Path) -> Result<Vec<DirEntry>, StorageError> {
        let state = self.state.lock().unwrap();
        if !state.dirs.contains(path) {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        let mut entries = Vec::new();
        for dir in &state.dirs {
            if dir.parent() == Some(path) {
                if let Some(name) = dir.file_name() {
                    entries.push(DirEntry {
                        name: name.to_string_lossy().into_owned(),
                        kind: EntryKind::Dir,
                    });
                }
            }
        }
        for file in state.files.keys() {
            if file.parent() == Some(path) {
                if let Some(name) = file.file_name() {
                    entries.push(DirEntry {
                        name: name.to_string_lossy().into_owned(),
                        kind: EntryKind::File,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn rename(&self, old: &Path, new: &Path) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_rename_to.as_deref() == Some(new) {
            state.fail_rename_to = None;
            return Err(StorageError::Unknown(format!(
                "injected rename failure: {}",
                new.display()
            )));
        }
        if state.files.contains_key(old) {
            let content = state.files.remove(old).unwrap_or_default();
            state.files.insert(new.to_path_buf(), content);
            return Ok(());
        }
        if !state.dirs.contains(old) {
            return Err(StorageError::NotFound(old.to_path_buf()));
        }
        let moved_dirs: Vec<PathBuf> = state
            .dirs
            .iter()
            .filter(|d| d.starts_with(old))
            .cloned()
            .collect();
        for dir in moved_dirs {
            state.dirs.remove(&dir);
            if let Ok(tail) = dir.strip_prefix(old) {
                state.dirs.insert(new.join(tail));
            }
        }
        let moved_files: Vec<PathBuf> = state
            .files
            .keys()
            .filter(|f| f.starts_with(old))
            .cloned()
            .collect();
        for file in moved_files {
            if let Some(content) = state.files.remove(&file) {
                if let Ok(tail) = file.strip_prefix(old) {
                    state.files.insert(new.join(tail), content);
                }
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &Path) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))
    }

    async fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn size(&self, path: &Path) -> Result<u64, StorageError> {
        let state = self.state.lock().unwrap();
        let content = state
            .files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_path_buf()))?;
        let len = content.lock().unwrap().len();
        Ok(len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(storage: &MemStorage, path: &str, body: &[u8]) {
        let mut file = storage
            .open_write(Path::new(path), WriteMode::Truncate)
            .await
            .unwrap();
        file.write_all(body).await.unwrap();
    }

    #[tokio::test]
    async fn files_round_trip_and_list() {
        let storage = MemStorage::new();
        storage.mkdir_p(Path::new("a/b"), true).await.unwrap();
        write(&storage, "a/b/f1", b"hello").await;

        let mut file = storage.open_read(Path::new("a/b/f1")).await.unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(storage.size(Path::new("a/b/f1")).await.unwrap(), 5);

        let entries = storage.scandir(Path::new("a/b")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::File);
    }

    #[tokio::test]
    async fn rename_moves_whole_directories() {
        let storage = MemStorage::new();
        storage.mkdir_p(Path::new("x/old"), true).await.unwrap();
        write(&storage, "x/old/seg", b"data").await;

        storage
            .rename(Path::new("x/old"), Path::new("x/new"))
            .await
            .unwrap();
        assert!(!storage.exists(Path::new("x/old")).await.unwrap());
        assert_eq!(storage.contents("x/new/seg").unwrap(), b"data");
    }

    #[tokio::test]
    async fn injected_rename_failure_fires_once() {
        let storage = MemStorage::new();
        storage.mkdir_p(Path::new("d/from"), true).await.unwrap();
        storage.fail_next_rename_to("d/to");

        let err = storage
            .rename(Path::new("d/from"), Path::new("d/to"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unknown(_)));
        // one-shot: the retry goes through
        storage
            .rename(Path::new("d/from"), Path::new("d/to"))
            .await
            .unwrap();
        assert!(storage.exists(Path::new("d/to")).await.unwrap());
    }

    #[tokio::test]
    async fn rmdir_refuses_occupied_directories() {
        let storage = MemStorage::new();
        storage.mkdir_p(Path::new("p/q"), true).await.unwrap();
        write(&storage, "p/q/f", b"x").await;
        assert!(storage.rmdir(Path::new("p/q")).await.is_err());
        storage.unlink(Path::new("p/q/f")).await.unwrap();
        storage.rmdir(Path::new("p/q")).await.unwrap();
    }
}
