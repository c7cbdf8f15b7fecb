//! Stream/non-stream content cache.
//!
//! Cached artifacts live under `<cache_root>/cached/<doc-id>/<detail>`,
//! where the doc id is the encrypted resource handle (its Base64 alphabet
//! includes `/`, so an entry directory may nest — by design). A missing
//! entry is populated exactly once: the writer holds an exclusive advisory
//! lock for the whole population, contenders surface HTTP 409, and readers
//! only probe the lock — they never hold it while serving.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::Stream;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::keystore::{self, CacheMetadata};
use crate::processor::{CacheSource, DataBlock, ProcessorError};
use crate::rpc::{ErrorDomain, ErrorInfo};
use crate::storage::{StorageBackend, StorageError, StorageFile};

/// Directory under the cache root holding every entry
pub const CACHE_DIR_NAME: &str = "cached";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry is being populated by another request")]
    Busy,
    #[error("cache metadata missing or corrupt")]
    MissingMetadata,
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CacheError {
    /// Fill the boundary error object, including the HTTP status the
    /// delivery layer should answer with.
    pub fn write_into(&self, err: &mut ErrorInfo) {
        match self {
            CacheError::Busy => {
                err.set(ErrorDomain::Storage, "internal error");
                err.set_http_resp_code(409);
            }
            CacheError::MissingMetadata => {
                err.set(ErrorDomain::Storage, "internal error");
                err.set_http_resp_code(404);
            }
            CacheError::Processor(e) => e.write_into(err),
            _ => err.set(ErrorDomain::Storage, "internal error"),
        }
    }
}

/// Instantiates the resident processor that produces a cache entry's
/// content from its sidecar metadata (stream resources).
pub trait ResidentProcessorFactory: Send + Sync {
    fn instantiate(
        &self,
        metadata: &CacheMetadata,
        detail: &str,
    ) -> Result<Box<dyn CacheSource>, CacheError>;
}

/// Production factory: resolves the sidecar mimetype through the processor
/// registry. `video/hls` is the only stream-capable variant today.
pub struct RegistryProcessorFactory {
    pub dest: Arc<dyn StorageBackend>,
    pub keys: Arc<crate::keystore::KeyManager>,
    pub block_bytes: usize,
}

impl ResidentProcessorFactory for RegistryProcessorFactory {
    fn instantiate(
        &self,
        metadata: &CacheMetadata,
        detail: &str,
    ) -> Result<Box<dyn CacheSource>, CacheError> {
        match crate::processor::lookup(&metadata.mimetype).map(|e| e.kind) {
            Some(crate::processor::ProcessorKind::HlsDestination) => {
                let stream = crate::processor::HlsStream::new(
                    self.dest.clone(),
                    self.keys.clone(),
                    metadata.clone(),
                    detail,
                    self.block_bytes,
                )?;
                Ok(Box::new(stream))
            }
            _ => Err(CacheError::MissingMetadata),
        }
    }
}

/// Where a missing entry's bytes come from
pub enum PopulateSource {
    /// Resident processor resolved from the sidecar mimetype
    Processor(Arc<dyn ResidentProcessorFactory>),
    /// Straight copy from another storage (non-stream resources)
    Remote {
        storage: Arc<dyn StorageBackend>,
        path: PathBuf,
    },
}

enum EntryState {
    /// Entry exists; reads go straight to the file, no lock involved
    Cached,
    /// This request owns the advisory lock and writes through
    PopulatingProcessor(Box<dyn CacheSource>),
    PopulatingRemote {
        storage: Arc<dyn StorageBackend>,
        path: PathBuf,
        file: Option<Box<dyn StorageFile>>,
    },
    Closed,
}

pub struct CacheEntry {
    path: PathBuf,
    file: Option<fs::File>,
    lock_guard: Option<std::fs::File>,
    locked: bool,
    state: EntryState,
    buffer_bytes: usize,
}

/// `<cache_root>/cached/<doc-id>`
pub fn doc_dir(cache_root: &Path, doc_id: &str) -> PathBuf {
    cache_root.join(CACHE_DIR_NAME).join(doc_id)
}

impl CacheEntry {
    /// Open (or start populating) the entry `<doc-id>/<detail>`.
    ///
    /// An existing file is served as-is. Otherwise the sidecar metadata is
    /// consulted, the populate source prepared, parent directories created,
    /// and the write lock taken before the file is truncated.
    pub async fn open(
        cache_root: &Path,
        doc_id: &str,
        detail: &str,
        buffer_bytes: usize,
        source: PopulateSource,
    ) -> Result<Self, CacheError> {
        let dir = doc_dir(cache_root, doc_id);
        let direct = dir.join(detail);
        match fs::File::open(&direct).await {
            Ok(file) => {
                // an existing file may still be mid-population; probe the
                // writer's exclusive lock without holding anything while
                // serving
                let probe = file.try_clone().await?.into_std().await;
                match fs2::FileExt::try_lock_shared(&probe) {
                    Ok(()) => {
                        let _ = fs2::FileExt::unlock(&probe);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        warn!(path = %direct.display(), "cache entry locked by a peer");
                        return Err(CacheError::Busy);
                    }
                    Err(e) => return Err(e.into()),
                }
                debug!(path = %direct.display(), "cache hit");
                return Ok(CacheEntry {
                    path: direct,
                    file: Some(file),
                    lock_guard: None,
                    locked: false,
                    state: EntryState::Cached,
                    buffer_bytes: buffer_bytes.max(1),
                });
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let metadata = keystore::load_cache_metadata(&dir)
            .await
            .map_err(|_| CacheError::MissingMetadata)?;
        if metadata.mimetype.is_empty() {
            return Err(CacheError::MissingMetadata);
        }

        let (state, resolved_detail) = match source {
            PopulateSource::Processor(factory) => {
                let mut processor = factory.instantiate(&metadata, detail)?;
                let resolved = processor.init().await?;
                (EntryState::PopulatingProcessor(processor), resolved)
            }
            PopulateSource::Remote { storage, path } => (
                EntryState::PopulatingRemote {
                    storage,
                    path,
                    file: None,
                },
                detail.to_string(),
            ),
        };

        let path = dir.join(&resolved_detail);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        // the lock must precede the truncate; contenders must never clobber
        // the writer's bytes
        let guard = file.try_clone().await?.into_std().await;
        if let Err(e) = fs2::FileExt::try_lock_exclusive(&guard) {
            if e.kind() == ErrorKind::WouldBlock {
                warn!(path = %path.display(), "cache entry locked by a peer");
                return Err(CacheError::Busy);
            }
            return Err(e.into());
        }
        file.set_len(0).await?;

        Ok(CacheEntry {
            path,
            file: Some(file),
            lock_guard: Some(guard),
            locked: true,
            state,
            buffer_bytes: buffer_bytes.max(1),
        })
    }

    pub fn already_cached(&self) -> bool {
        matches!(self.state, EntryState::Cached)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position the read cursor (ranged reads on a cached entry)
    pub async fn seek(&mut self, pos: u64) -> Result<(), CacheError> {
        if let Some(file) = self.file.as_mut() {
            file.seek(std::io::SeekFrom::Start(pos)).await?;
        }
        Ok(())
    }

    /// Produce the next data block.
    ///
    /// Populating entries pull from the resident processor or the remote
    /// source and write through to the cache file; cached entries read from
    /// disk, a short read marking the final block.
    pub async fn proceed(&mut self) -> Result<DataBlock, CacheError> {
        match &mut self.state {
            EntryState::Cached => {
                let Some(file) = self.file.as_mut() else {
                    return Err(CacheError::Io(std::io::Error::new(
                        ErrorKind::Other,
                        "cache entry closed",
                    )));
                };
                let mut buf = vec![0u8; self.buffer_bytes];
                let nread = file.read(&mut buf).await?;
                buf.truncate(nread);
                Ok(DataBlock {
                    data: buf,
                    is_final: nread < self.buffer_bytes,
                })
            }
            EntryState::PopulatingProcessor(processor) => {
                let block = processor.next_block().await?;
                if !block.data.is_empty() {
                    if let Some(file) = self.file.as_mut() {
                        file.write_all(&block.data).await?;
                        if block.is_final {
                            file.flush().await?;
                        }
                    }
                }
                Ok(block)
            }
            EntryState::PopulatingRemote {
                storage,
                path,
                file,
            } => {
                if file.is_none() {
                    *file = Some(storage.open_read(path).await?);
                }
                let mut buf = vec![0u8; self.buffer_bytes];
                let nread = match file.as_mut() {
                    Some(remote) => remote.read(&mut buf).await?,
                    None => 0,
                };
                buf.truncate(nread);
                let is_final = nread < self.buffer_bytes;
                if !buf.is_empty() {
                    if let Some(local) = self.file.as_mut() {
                        local.write_all(&buf).await?;
                        if is_final {
                            local.flush().await?;
                        }
                    }
                }
                Ok(DataBlock {
                    data: buf,
                    is_final,
                })
            }
            EntryState::Closed => Err(CacheError::Io(std::io::Error::new(
                ErrorKind::Other,
                "cache entry closed",
            ))),
        }
    }

    /// Tear the entry down: resident processor first, then the advisory
    /// lock (always released when the flag says it is held), then the file.
    pub async fn close(&mut self) -> Result<(), CacheError> {
        if let EntryState::PopulatingProcessor(processor) =
            &mut self.state
        {
            loop {
                match processor.deinit().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(error = %e, "resident processor teardown error");
                        break;
                    }
                }
            }
        }
        self.state = EntryState::Closed;
        if self.locked {
            if let Some(guard) = self.lock_guard.take() {
                if let Err(e) = fs2::FileExt::unlock(&guard) {
                    warn!(error = %e, "advisory unlock failed");
                }
            }
            self.locked = false;
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await.ok();
        }
        Ok(())
    }

    /// Turn the entry into a block stream for response generation; the
    /// entry closes itself after the final block or the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, CacheError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut entry = state?;
            match entry.proceed().await {
                Ok(block) => {
                    if block.is_final {
                        let _ = entry.close().await;
                        Some((Ok(block.data), None))
                    } else {
                        Some((Ok(block.data), Some(entry)))
                    }
                }
                Err(e) => {
                    let _ = entry.close().await;
                    Some((Err(e), None))
                }
            }
        })
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        // flag and kernel state stay in sync even on abandoned entries
        if self.locked {
            if let Some(guard) = self.lock_guard.take() {
                let _ = fs2::FileExt::unlock(&guard);
            }
            self.locked = false;
        }
    }
}

/// True when the cached file is older than `threshold_secs` (or empty),
/// meaning the caller should refresh it.
pub async fn is_stale(path: &Path, threshold_secs: u64) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => {
            if meta.len() == 0 {
                return true;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok());
            age.map(|a| a.as_secs() >= threshold_secs).unwrap_or(true)
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use futures::StreamExt;

    struct FixedBlocks {
        blocks: Vec<Vec<u8>>,
        detail: String,
        cursor: usize,
    }

    #[async_trait::async_trait]
    impl CacheSource for FixedBlocks {
        async fn init(&mut self) -> Result<String, ProcessorError> {
            Ok(self.detail.clone())
        }
        async fn next_block(&mut self) -> Result<DataBlock, ProcessorError> {
            let idx = self.cursor;
            self.cursor += 1;
            Ok(DataBlock {
                data: self.blocks.get(idx).cloned().unwrap_or_default(),
                is_final: self.cursor >= self.blocks.len(),
            })
        }
        async fn deinit(&mut self) -> Result<bool, ProcessorError> {
            Ok(false)
        }
    }

    struct FixedFactory {
        blocks: Vec<Vec<u8>>,
    }

    impl ResidentProcessorFactory for FixedFactory {
        fn instantiate(
            &self,
            _metadata: &CacheMetadata,
            detail: &str,
        ) -> Result<Box<dyn CacheSource>, CacheError> {
            Ok(Box::new(FixedBlocks {
                blocks: self.blocks.clone(),
                detail: detail.to_string(),
                cursor: 0,
            }))
        }
    }

    fn factory(blocks: Vec<Vec<u8>>) -> PopulateSource {
        PopulateSource::Processor(Arc::new(FixedFactory { blocks }))
    }

    async fn write_metadata(dir: &Path) {
        keystore::save_cache_metadata(
            dir,
            &CacheMetadata {
                mimetype: "hls".to_string(),
                key_id: "908e3873".to_string(),
                usr_id: 9,
                upld_req: 0x55,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cache_hit_serves_bytes_without_lock() {
        let root = tempfile::tempdir().unwrap();
        let dir = doc_dir(root.path(), "docA/sub");
        fs::create_dir_all(dir.join("abc/def")).await.unwrap();
        fs::write(dir.join("abc/def/ghij.txt"), b"cached body")
            .await
            .unwrap();

        let mut entry = CacheEntry::open(
            root.path(),
            "docA/sub",
            "abc/def/ghij.txt",
            64,
            factory(vec![]),
        )
        .await
        .unwrap();
        assert!(entry.already_cached());
        assert!(!entry.locked);

        let block = entry.proceed().await.unwrap();
        assert_eq!(block.data, b"cached body");
        assert!(block.is_final);
        entry.close().await.unwrap();
    }

    #[tokio::test]
    async fn miss_populates_through_resident_processor() {
        let root = tempfile::tempdir().unwrap();
        let dir = doc_dir(root.path(), "docB");
        write_metadata(&dir).await;

        let blocks = vec![b"first ".to_vec(), b"second".to_vec()];
        let mut entry =
            CacheEntry::open(root.path(), "docB", "out.bin", 64, factory(blocks)).await.unwrap();
        assert!(!entry.already_cached());
        assert!(entry.locked);

        let mut served = Vec::new();
        loop {
            let block = entry.proceed().await.unwrap();
            served.extend_from_slice(&block.data);
            if block.is_final {
                break;
            }
        }
        entry.close().await.unwrap();

        assert_eq!(served, b"first second");
        let on_disk = fs::read(dir.join("out.bin")).await.unwrap();
        assert_eq!(on_disk, b"first second");
    }

    #[tokio::test]
    async fn second_writer_sees_busy() {
        let root = tempfile::tempdir().unwrap();
        let dir = doc_dir(root.path(), "docC");
        write_metadata(&dir).await;

        let first = CacheEntry::open(
            root.path(),
            "docC",
            "out.bin",
            64,
            factory(vec![b"x".to_vec()]),
        )
        .await
        .unwrap();

        let second = CacheEntry::open(
            root.path(),
            "docC",
            "out.bin",
            64,
            factory(vec![b"y".to_vec()]),
        )
        .await;
        let err = second.err().expect("second writer must be refused");
        assert!(matches!(err, CacheError::Busy));
        let mut info = ErrorInfo::new();
        err.write_into(&mut info);
        assert_eq!(info.http_resp_code(), Some(409));

        drop(first);
        // lock released with the first entry; a third writer may proceed
        let third = CacheEntry::open(
            root.path(),
            "docC",
            "out.bin",
            64,
            factory(vec![b"z".to_vec()]),
        )
        .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn corrupt_metadata_maps_to_404() {
        let root = tempfile::tempdir().unwrap();
        let dir = doc_dir(root.path(), "docD");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("metadata.json"), b"").await.unwrap();

        let err = CacheEntry::open(root.path(), "docD", "out.bin", 64, factory(vec![]))
            .await
            .err()
            .expect("corrupt metadata must refuse");
        assert!(matches!(err, CacheError::MissingMetadata));
        let mut info = ErrorInfo::new();
        err.write_into(&mut info);
        assert_eq!(info.http_resp_code(), Some(404));
        // the entry itself was never created
        assert!(!dir.join("out.bin").exists());
    }

    #[tokio::test]
    async fn remote_populate_copies_bytes() {
        let root = tempfile::tempdir().unwrap();
        let remote_root = tempfile::tempdir().unwrap();
        tokio::fs::write(remote_root.path().join("pic.jpg"), b"remote image bytes")
            .await
            .unwrap();
        let dir = doc_dir(root.path(), "docE");
        write_metadata(&dir).await;

        let remote: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(remote_root.path()));
        let mut entry = CacheEntry::open(
            root.path(),
            "docE",
            "pic.jpg",
            8,
            PopulateSource::Remote {
                storage: remote,
                path: PathBuf::from("pic.jpg"),
            },
        )
        .await
        .unwrap();

        let mut served = Vec::new();
        loop {
            let block = entry.proceed().await.unwrap();
            served.extend_from_slice(&block.data);
            if block.is_final {
                break;
            }
        }
        entry.close().await.unwrap();
        assert_eq!(served, b"remote image bytes");
        assert_eq!(
            fs::read(dir.join("pic.jpg")).await.unwrap(),
            b"remote image bytes"
        );
    }

    #[tokio::test]
    async fn stream_generator_yields_all_blocks() {
        let root = tempfile::tempdir().unwrap();
        let dir = doc_dir(root.path(), "docF");
        write_metadata(&dir).await;

        let blocks = vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()];
        let entry =
            CacheEntry::open(root.path(), "docF", "out.bin", 64, factory(blocks)).await.unwrap();
        let collected: Vec<Vec<u8>> = entry
            .into_stream()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(collected.concat(), b"aabbcc");
    }

    #[tokio::test]
    async fn staleness_tracks_age_and_emptiness() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("f");
        assert!(is_stale(&path, 1).await); // missing
        fs::write(&path, b"").await.unwrap();
        assert!(is_stale(&path, 3600).await); // empty
        fs::write(&path, b"body").await.unwrap();
        assert!(!is_stale(&path, 3600).await); // fresh
        assert!(is_stale(&path, 0).await); // zero threshold
    }
}
