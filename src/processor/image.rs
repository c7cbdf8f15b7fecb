//! Image source/destination processors.
//!
//! Images are small enough to preload: the source copies every chunk of the
//! upload into memory before a single decode pass. The destination encodes
//! into one output file, stages it locally and publishes it through the
//! same staged commit protocol the video destinations use.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::codec::{Decoder, Encoder, MediaFrame};
use super::mp4::open_source_chunk;
use super::{DestinationProcessor, FileProcessor, ProcessorError, SourceProcessor};
use crate::commit::{CommitManager, TRANSCODING_DIR};
use crate::rpc::ResourceKey;
use crate::storage::{StorageBackend, StorageFile, WriteMode};
use crate::transfer::{SegmentTransfer, TransferredFiles};

pub struct ImageSource {
    storage: Arc<dyn StorageBackend>,
    basepath: PathBuf,
    parts_size: Vec<u64>,
    decoder: Box<dyn Decoder>,
    current: Option<Box<dyn StorageFile>>,
    chunk_idx: usize,
    buffer: Vec<u8>,
    preload: Vec<u8>,
    pending: Vec<MediaFrame>,
    consumed: u64,
    done: bool,
}

impl ImageSource {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        basepath: impl Into<PathBuf>,
        parts_size: Vec<u64>,
        decoder: Box<dyn Decoder>,
        read_buffer_bytes: usize,
    ) -> Self {
        let nbytes_required: u64 = parts_size.iter().sum();
        ImageSource {
            storage,
            basepath: basepath.into(),
            parts_size,
            decoder,
            current: None,
            chunk_idx: 0,
            buffer: vec![0u8; read_buffer_bytes.max(1)],
            preload: Vec::with_capacity(nbytes_required as usize),
            pending: Vec::new(),
            consumed: 0,
            done: false,
        }
    }
}

#[async_trait::async_trait]
impl FileProcessor for ImageSource {
    async fn init(&mut self) -> Result<(), ProcessorError> {
        if self.parts_size.is_empty() {
            return Err(ProcessorError::Spec(
                "parts_size declares no source chunks".to_string(),
            ));
        }
        self.current = Some(open_source_chunk(&self.storage, &self.basepath, 0).await?);
        self.chunk_idx = 0;
        Ok(())
    }

    async fn process(&mut self) -> Result<(), ProcessorError> {
        if self.done {
            return Ok(());
        }
        let Some(file) = self.current.as_mut() else {
            return Err(ProcessorError::Transcode(
                "source processor not initialized".to_string(),
            ));
        };
        let nread = file.read(&mut self.buffer).await?;
        if nread > 0 {
            self.consumed += nread as u64;
            self.preload.extend_from_slice(&self.buffer[..nread]);
            return Ok(());
        }
        if self.chunk_idx + 1 < self.parts_size.len() {
            self.chunk_idx += 1;
            self.current =
                Some(open_source_chunk(&self.storage, &self.basepath, self.chunk_idx).await?);
            return Ok(());
        }
        // fully preloaded; one decode pass produces the picture
        let preload = std::mem::take(&mut self.preload);
        self.pending.extend(self.decoder.decode(&preload)?);
        self.pending.extend(self.decoder.flush()?);
        self.current = None;
        self.done = true;
        debug!(nbytes = preload.len(), "image preloaded and decoded");
        Ok(())
    }

    fn has_done_processing(&self) -> bool {
        self.done
    }

    async fn deinit(&mut self) -> Result<bool, ProcessorError> {
        self.current = None;
        self.pending.clear();
        self.preload.clear();
        Ok(false)
    }
}

#[async_trait::async_trait]
impl SourceProcessor for ImageSource {
    fn take_frames(&mut self) -> Vec<MediaFrame> {
        std::mem::take(&mut self.pending)
    }

    fn bytes_consumed(&self) -> u64 {
        self.consumed
    }
}

pub struct ImageDestinationParams {
    pub resource: ResourceKey,
    pub version: String,
    pub is_update: bool,
    pub container: String,
    pub local: Arc<dyn StorageBackend>,
    pub local_base: PathBuf,
    pub dest: Arc<dyn StorageBackend>,
    pub transfer_buffer_bytes: usize,
    pub encoder: Box<dyn Encoder>,
}

pub struct ImageDestination {
    resource: ResourceKey,
    version: String,
    is_update: bool,
    container: String,
    local: Arc<dyn StorageBackend>,
    local_base: PathBuf,
    commit: CommitManager,
    transfer: SegmentTransfer,
    encoder: Box<dyn Encoder>,
    pending: Vec<MediaFrame>,
    output: Vec<u8>,
    files: TransferredFiles,
    bytes_written: u64,
    end_of_input: bool,
    done: bool,
}

impl ImageDestination {
    pub fn new(params: ImageDestinationParams) -> Self {
        let dest_base =
            CommitManager::version_dir(&params.resource, TRANSCODING_DIR, &params.version);
        let transfer = SegmentTransfer::new(
            params.local.clone(),
            params.local_base.clone(),
            params.dest.clone(),
            dest_base,
            params.transfer_buffer_bytes,
        );
        ImageDestination {
            resource: params.resource,
            version: params.version,
            is_update: params.is_update,
            container: params.container,
            local: params.local,
            local_base: params.local_base,
            commit: CommitManager::new(params.dest),
            transfer,
            encoder: params.encoder,
            pending: Vec::new(),
            output: Vec::new(),
            files: TransferredFiles::new(),
            bytes_written: 0,
            end_of_input: false,
            done: false,
        }
    }

    fn output_filename(&self) -> String {
        format!("image.{}", self.container)
    }
}

#[async_trait::async_trait]
impl FileProcessor for ImageDestination {
    async fn init(&mut self) -> Result<(), ProcessorError> {
        self.local.mkdir_p(&self.local_base, true).await?;
        let dest_dir = CommitManager::version_dir(&self.resource, TRANSCODING_DIR, &self.version);
        self.commit.storage().mkdir_p(&dest_dir, true).await?;
        Ok(())
    }

    async fn process(&mut self) -> Result<(), ProcessorError> {
        if self.done {
            return Ok(());
        }
        if !self.pending.is_empty() {
            let frames = std::mem::take(&mut self.pending);
            for frame in &frames {
                for chunk in self.encoder.encode(frame)? {
                    self.output.extend_from_slice(&chunk.data);
                }
            }
            return Ok(());
        }
        if self.end_of_input {
            for chunk in self.encoder.flush()? {
                self.output.extend_from_slice(&chunk.data);
            }
            let filename = self.output_filename();
            let path = self.local_base.join(&filename);
            let mut file = self.local.open_write(&path, WriteMode::Truncate).await?;
            file.write_all(&self.output).await?;
            file.flush().await?;
            drop(file);
            let nbytes = self
                .transfer
                .transfer_file(&filename, &filename, &mut self.files)
                .await?;
            self.bytes_written += nbytes;
            self.done = true;
        }
        Ok(())
    }

    fn has_done_processing(&self) -> bool {
        self.done
    }

    async fn deinit(&mut self) -> Result<bool, ProcessorError> {
        self.pending.clear();
        self.output.clear();
        if let Err(e) = crate::commit::remove_dir_recursive(&self.local, &self.local_base).await {
            if !matches!(
                e,
                crate::commit::CommitError::Remove(ref s) if s.is_not_found()
            ) {
                debug!(version = %self.version, error = %e, "staging dir left behind");
            }
        }
        Ok(false)
    }
}

#[async_trait::async_trait]
impl DestinationProcessor for ImageDestination {
    fn version(&self) -> &str {
        &self.version
    }

    fn is_update(&self) -> bool {
        self.is_update
    }

    fn accept_frames(&mut self, frames: &[MediaFrame]) {
        self.pending.extend_from_slice(frames);
    }

    fn end_of_input(&mut self) {
        self.end_of_input = true;
    }

    async fn commit(&mut self) -> Result<(), ProcessorError> {
        if !self.done {
            return Err(ProcessorError::Transcode(
                "commit before processing finished".to_string(),
            ));
        }
        self.commit
            .write_version_metadata(&self.resource, &self.version, &self.files)
            .await
            .map_err(|e| ProcessorError::Transcode(e.to_string()))?;
        self.commit
            .publish_version(&self.resource, &self.version, self.is_update)
            .await
            .map_err(|e| ProcessorError::Transcode(e.to_string()))?;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::codec::{CodecBackend, PassthroughCodec};
    use crate::storage::LocalStorage;

    #[tokio::test]
    async fn image_transcodes_into_single_committed_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();

        tokio::fs::write(src_dir.path().join("1"), b"png-ish payload")
            .await
            .unwrap();

        let backend = PassthroughCodec::new(1024);
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(src_dir.path()));
        let mut source = ImageSource::new(storage, "", vec![15], backend.new_decoder(), 8);
        source.init().await.unwrap();

        let resource = ResourceKey::new(7, 0x11).unwrap();
        let local: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(local_dir.path()));
        let dest: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dest_dir.path()));
        let mut dst = ImageDestination::new(ImageDestinationParams {
            resource,
            version: "p0".to_string(),
            is_update: false,
            container: "jpg".to_string(),
            local,
            local_base: PathBuf::from("p0"),
            dest,
            transfer_buffer_bytes: 16,
            encoder: backend.new_encoder("jpg"),
        });
        dst.init().await.unwrap();

        while !source.has_done_processing() {
            source.process().await.unwrap();
            dst.accept_frames(&source.take_frames());
        }
        dst.end_of_input();
        while !dst.has_done_processing() {
            dst.process().await.unwrap();
        }
        dst.commit().await.unwrap();

        let committed = dest_dir
            .path()
            .join(resource.dir_name())
            .join("committed/p0");
        let body = tokio::fs::read(committed.join("image.jpg")).await.unwrap();
        assert_eq!(body, b"png-ish payload");
        assert!(committed.join("transcoded.json").is_file());
    }
}
