//! Segment transfer engine.
//!
//! Moves ready segment/generic files from the local staging area to a
//! destination storage, computing a SHA-1 checksum on the fly and recording
//! `{size, checksum}` per transferred file into the version's file report.
//! The report becomes the commit payload published next to the segments.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::config::SegmentNaming;
use crate::storage::{StorageBackend, StorageError, WriteMode};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("segment serial {serial} does not fit in {max_digits} digits")]
    SerialOutOfRange { serial: u32, max_digits: usize },
    #[error("segment naming has zero serial width")]
    InvalidTemplate,
    #[error("duplicate file entry: {0}")]
    DuplicateEntry(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Size and hex SHA-1 of one transferred file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub size: u64,
    pub checksum: String,
}

/// Filename-keyed report of every file belonging to a transcoded version.
///
/// Entries keep insertion order (the order local-side transfers completed,
/// not necessarily segment order). Duplicate filenames are a semantic error.
#[derive(Debug, Clone, Default)]
pub struct TransferredFiles {
    entries: Vec<(String, FileReport)>,
}

impl TransferredFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, report: FileReport) -> Result<(), TransferError> {
        if self.entries.iter().any(|(n, _)| *n == name) {
            return Err(TransferError::DuplicateEntry(name));
        }
        self.entries.push((name, report));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FileReport> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileReport)> + '_ {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, report) in &self.entries {
            map.insert(
                name.clone(),
                serde_json::json!({"size": report.size, "checksum": report.checksum}),
            );
        }
        serde_json::Value::Object(map)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, TransferError> {
        let mut out = TransferredFiles::new();
        if let Some(map) = value.as_object() {
            for (name, item) in map {
                let report: FileReport = serde_json::from_value(item.clone())
                    .map_err(|e| StorageError::Data(format!("corrupt file report: {e}")))?;
                out.insert(name.clone(), report)?;
            }
        }
        Ok(out)
    }
}

/// Format `<prefix><zero-padded serial>` under the configured naming scheme
pub fn segment_filename(naming: &SegmentNaming, serial: u32) -> Result<String, TransferError> {
    if naming.max_serial_digits == 0 {
        return Err(TransferError::InvalidTemplate);
    }
    let bound = 10u64.pow(naming.max_serial_digits as u32);
    if u64::from(serial) >= bound {
        return Err(TransferError::SerialOutOfRange {
            serial,
            max_digits: naming.max_serial_digits,
        });
    }
    Ok(format!(
        "{}{:0width$}",
        naming.prefix,
        serial,
        width = naming.max_serial_digits
    ))
}

/// One source+destination pairing for a single version's file transfers.
///
/// Owns the copy buffer shared between the local read side and the remote
/// write side; a transfer is exclusive for the lifetime of each call.
pub struct SegmentTransfer {
    local: Arc<dyn StorageBackend>,
    dest: Arc<dyn StorageBackend>,
    local_base: PathBuf,
    dest_base: PathBuf,
    buffer: Vec<u8>,
}

impl SegmentTransfer {
    pub fn new(
        local: Arc<dyn StorageBackend>,
        local_base: impl Into<PathBuf>,
        dest: Arc<dyn StorageBackend>,
        dest_base: impl Into<PathBuf>,
        buffer_bytes: usize,
    ) -> Self {
        SegmentTransfer {
            local,
            dest,
            local_base: local_base.into(),
            dest_base: dest_base.into(),
            buffer: vec![0u8; buffer_bytes],
        }
    }

    /// Transfer the segment at `chosen_idx` of the ready list.
    ///
    /// Returns `Ok(None)` when `chosen_idx` is past the end of the list;
    /// callers drive loop termination on that. On success the transferred
    /// byte count is returned and an entry keyed by the destination basename
    /// is appended to `files`.
    pub async fn transfer_segment(
        &mut self,
        naming: &SegmentNaming,
        ready_list: &[u32],
        chosen_idx: usize,
        files: &mut TransferredFiles,
    ) -> Result<Option<u64>, TransferError> {
        let Some(&serial) = ready_list.get(chosen_idx) else {
            return Ok(None);
        };
        let filename = segment_filename(naming, serial)?;
        let nbytes = self.copy_one(&filename, &filename, files).await?;
        Ok(Some(nbytes))
    }

    /// Transfer a generic (non-numbered) file, e.g. a playlist or the init
    /// packet map. The report entry is keyed by the destination basename.
    pub async fn transfer_file(
        &mut self,
        local_name: &str,
        dest_name: &str,
        files: &mut TransferredFiles,
    ) -> Result<u64, TransferError> {
        self.copy_one(local_name, dest_name, files).await
    }

    async fn copy_one(
        &mut self,
        local_name: &str,
        dest_name: &str,
        files: &mut TransferredFiles,
    ) -> Result<u64, TransferError> {
        let local_path = self.local_base.join(local_name);
        let dest_path = self.dest_base.join(dest_name);

        let mut src = self.local.open_read(&local_path).await?;
        let mut dst = self.dest.open_write(&dest_path, WriteMode::CreateNew).await?;

        let mut checksum = Sha1::new();
        let mut nbytes: u64 = 0;
        loop {
            let nread = src.read(&mut self.buffer).await?;
            if nread == 0 {
                break;
            }
            checksum.update(&self.buffer[..nread]);
            dst.write_all(&self.buffer[..nread]).await?;
            nbytes += nread as u64;
        }
        dst.flush().await?;
        drop(src);
        drop(dst);

        let digest = checksum.finalize();
        files.insert(
            dest_name.to_string(),
            FileReport {
                size: nbytes,
                checksum: hex::encode(digest),
            },
        )?;

        // local copy is no longer needed once the report entry exists
        match self.local.unlink(&local_path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        debug!(file = dest_name, nbytes, "segment transferred");
        Ok(nbytes)
    }
}
