//! MP4/MOV source processor.
//!
//! Uploads arrive as numbered chunks (`<resource-dir>/1`, `/2`, ...) whose
//! sizes are declared in the job's `parts_size` array. The processor walks
//! the chunks in order, feeds raw bytes to the decoder and queues decoded
//! frames for the orchestrator to fan out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::codec::{Decoder, MediaFrame};
use super::{FileProcessor, ProcessorError, SourceProcessor};
use crate::storage::{StorageBackend, StorageError, StorageFile};

/// On-disk name of a source chunk; chunk indices are 0-based, file names
/// start at 1.
pub fn chunk_file_name(chunk_idx: usize) -> String {
    format!("{}", chunk_idx + 1)
}

pub async fn open_source_chunk(
    storage: &Arc<dyn StorageBackend>,
    basepath: &Path,
    chunk_idx: usize,
) -> Result<Box<dyn StorageFile>, StorageError> {
    storage
        .open_read(&basepath.join(chunk_file_name(chunk_idx)))
        .await
}

/// Translate a logical byte offset into `(chunk_idx, intra-chunk offset)`
/// by walking the declared chunk sizes from `start_idx`.
///
/// An offset equal to a chunk's size stays inside that chunk, which makes
/// the function idempotent: applying it to its own output returns the same
/// pair. `None` when the offset runs past the declared sizes.
pub fn estimate_chunk_index(
    parts_size: &[u64],
    start_idx: usize,
    pos: u64,
) -> Option<(usize, u64)> {
    let mut offset = pos;
    let mut idx = start_idx;
    while idx < parts_size.len() {
        let chunk_sz = parts_size[idx];
        if offset > chunk_sz {
            offset -= chunk_sz;
            idx += 1;
        } else {
            break;
        }
    }
    if idx < parts_size.len() {
        Some((idx, offset))
    } else {
        None
    }
}

pub struct Mp4Source {
    storage: Arc<dyn StorageBackend>,
    basepath: PathBuf,
    parts_size: Vec<u64>,
    decoder: Box<dyn Decoder>,
    current: Option<Box<dyn StorageFile>>,
    chunk_idx: usize,
    buffer: Vec<u8>,
    pending: Vec<MediaFrame>,
    consumed: u64,
    done: bool,
}

impl Mp4Source {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        basepath: impl Into<PathBuf>,
        parts_size: Vec<u64>,
        decoder: Box<dyn Decoder>,
        read_buffer_bytes: usize,
    ) -> Self {
        Mp4Source {
            storage,
            basepath: basepath.into(),
            parts_size,
            decoder,
            current: None,
            chunk_idx: 0,
            buffer: vec![0u8; read_buffer_bytes.max(1)],
            pending: Vec::new(),
            consumed: 0,
            done: false,
        }
    }

    /// Close the current chunk and open the requested one (or the next)
    pub async fn switch_to_chunk(&mut self, target: Option<usize>) -> Result<(), ProcessorError> {
        let next = target.unwrap_or(self.chunk_idx + 1);
        if next >= self.parts_size.len() {
            return Err(ProcessorError::Transcode(format!(
                "source chunk {next} out of range"
            )));
        }
        self.current = Some(open_source_chunk(&self.storage, &self.basepath, next).await?);
        self.chunk_idx = next;
        debug!(chunk = next, "switched source chunk");
        Ok(())
    }

    /// Position the cursor at a logical byte offset across all chunks
    pub async fn seek_to(&mut self, offset: u64) -> Result<(), ProcessorError> {
        let (chunk_idx, intra) = estimate_chunk_index(&self.parts_size, 0, offset)
            .ok_or_else(|| {
                ProcessorError::Transcode(format!("offset {offset} past declared chunk sizes"))
            })?;
        self.switch_to_chunk(Some(chunk_idx)).await?;
        if let Some(file) = self.current.as_mut() {
            file.seek(std::io::SeekFrom::Start(intra)).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileProcessor for Mp4Source {
    async fn init(&mut self) -> Result<(), ProcessorError> {
        if self.parts_size.is_empty() {
            return Err(ProcessorError::Spec(
                "parts_size declares no source chunks".to_string(),
            ));
        }
        self.switch_to_chunk(Some(0)).await
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
            let frames = self.decoder.decode(&self.buffer[..nread])?;
            self.pending.extend(frames);
            return Ok(());
        }
        // current chunk exhausted
        if self.chunk_idx + 1 < self.parts_size.len() {
            self.switch_to_chunk(None).await
        } else {
            self.pending.extend(self.decoder.flush()?);
            self.current = None;
            self.done = true;
            debug!("source fully decoded");
            Ok(())
        }
    }

    fn has_done_processing(&self) -> bool {
        self.done
    }

    async fn deinit(&mut self) -> Result<bool, ProcessorError> {
        self.current = None;
        self.pending.clear();
        Ok(false)
    }
}

#[async_trait::async_trait]
impl SourceProcessor for Mp4Source {
    fn take_frames(&mut self) -> Vec<MediaFrame> {
        std::mem::take(&mut self.pending)
    }

    fn bytes_consumed(&self) -> u64 {
        self.consumed
    }
}
