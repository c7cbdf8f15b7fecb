//! Polymorphic per-format file processors.
//!
//! A processor either plays the *source* role (demux/decode an uploaded
//! file) or the *destination* role (filter/encode/mux one output version).
//! Variants register their labels in [`PROCESSOR_TABLE`]; lookup is a
//! linear scan, first match wins. Sources are selected by sniffing the
//! first bytes of the upload, destinations by the output spec's container
//! label.

pub mod codec;
mod hls;
mod image;
mod mp4;

pub use codec::{BackendKind, CodecBackend, CodecError, MediaFrame, PassthroughCodec};
pub use hls::{
    HlsDestination, HlsDestinationParams, HlsStream, HLS_FMP4_FILENAME, HLS_KEY_REQUEST_LABEL,
    HLS_MASTER_PLAYLIST_FILENAME, HLS_PLAYLIST_FILENAME,
};
pub use image::{ImageDestination, ImageDestinationParams, ImageSource};
pub use mp4::{estimate_chunk_index, open_source_chunk, Mp4Source};

use thiserror::Error;

use crate::keystore::KeystoreError;
use crate::rpc::{ErrorDomain, ErrorInfo};
use crate::storage::StorageError;
use crate::transfer::TransferError;

/// How much of the first source chunk is sniffed to pick the source variant
pub const SOURCE_SNIFF_BYTES: usize = 64;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("transcoder failure: {0}")]
    Codec(#[from] CodecError),
    #[error("transcode failure: {0}")]
    Transcode(String),
    #[error("invalid spec: {0}")]
    Spec(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

impl ProcessorError {
    /// Boundary domain this failure belongs to
    pub fn domain(&self) -> ErrorDomain {
        match self {
            ProcessorError::Codec(_) => ErrorDomain::Transcoder,
            ProcessorError::Transcode(_) => ErrorDomain::Transcode,
            ProcessorError::Spec(_) => ErrorDomain::NonField,
            ProcessorError::Storage(_) => ErrorDomain::Storage,
            ProcessorError::Transfer(TransferError::Storage(_)) => ErrorDomain::Storage,
            ProcessorError::Transfer(_) => ErrorDomain::Transcode,
            ProcessorError::Keystore(_) => ErrorDomain::Transcoder,
        }
    }

    pub fn write_into(&self, err: &mut ErrorInfo) {
        err.set(self.domain(), self.to_string());
    }
}

/// One block produced for the cache layer
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Operation set every processor variant implements.
///
/// `process` performs one cooperative unit of work and yields; the caller
/// keeps invoking it until `has_done_processing` turns true. `deinit`
/// returns `true` while teardown still needs further calls.
#[async_trait::async_trait]
pub trait FileProcessor: Send {
    async fn init(&mut self) -> Result<(), ProcessorError>;
    async fn process(&mut self) -> Result<(), ProcessorError>;
    fn has_done_processing(&self) -> bool;
    async fn deinit(&mut self) -> Result<bool, ProcessorError>;
}

/// Source role: decode the upload into frames the orchestrator fans out
#[async_trait::async_trait]
pub trait SourceProcessor: FileProcessor {
    /// Drain the frames decoded by the last `process` call
    fn take_frames(&mut self) -> Vec<MediaFrame>;
    /// Raw bytes consumed so far, for progress reporting
    fn bytes_consumed(&self) -> u64;
}

/// Destination role: consume frames, write one output version, publish it
#[async_trait::async_trait]
pub trait DestinationProcessor: FileProcessor {
    fn version(&self) -> &str;
    fn is_update(&self) -> bool;
    /// Queue decoded frames for the next `process` call
    fn accept_frames(&mut self, frames: &[MediaFrame]);
    /// The source has no more frames; flush and finish on the next calls
    fn end_of_input(&mut self);
    /// Publish this version through the staged commit protocol
    async fn commit(&mut self) -> Result<(), ProcessorError>;
    /// Total bytes landed on the destination storage so far
    fn bytes_written(&self) -> u64;
}

/// Resident processor populating a cache entry block-by-block.
///
/// `init` resolves the detail path the processor will produce (relative to
/// the cache entry directory); `next_block` yields data until a block
/// carries `is_final`.
#[async_trait::async_trait]
pub trait CacheSource: Send {
    async fn init(&mut self) -> Result<String, ProcessorError>;
    async fn next_block(&mut self) -> Result<DataBlock, ProcessorError>;
    async fn deinit(&mut self) -> Result<bool, ProcessorError>;
}

/// Which concrete processor a registry entry instantiates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    VideoSource,
    HlsDestination,
    ImageSource,
    ImageDestination,
}

pub struct RegistryEntry {
    pub backend: BackendKind,
    pub kind: ProcessorKind,
    pub labels: &'static [&'static str],
}

/// Static variant registry; order matters, first match wins
pub static PROCESSOR_TABLE: &[RegistryEntry] = &[
    RegistryEntry {
        backend: BackendKind::Ffmpeg,
        kind: ProcessorKind::VideoSource,
        labels: &["video/mp4", "video/quicktime", "mp4", "mov"],
    },
    RegistryEntry {
        backend: BackendKind::Ffmpeg,
        kind: ProcessorKind::HlsDestination,
        labels: &["hls", "application/x-mpegURL", "video/hls"],
    },
    RegistryEntry {
        backend: BackendKind::Ffmpeg,
        kind: ProcessorKind::ImageSource,
        labels: &["image/jpeg", "image/png", "image/gif", "image/tiff"],
    },
    RegistryEntry {
        backend: BackendKind::Ffmpeg,
        kind: ProcessorKind::ImageDestination,
        labels: &["jpg", "jpeg", "png", "gif"],
    },
];

/// True when `label` begins with any of the expected labels
pub fn label_match(label: &str, expected: &[&str]) -> bool {
    expected.iter().any(|exp| label.starts_with(exp))
}

pub fn lookup(label: &str) -> Option<&'static RegistryEntry> {
    PROCESSOR_TABLE
        .iter()
        .find(|entry| label_match(label, entry.labels))
}

/// Sniff the upload's MIME label from its first bytes.
///
/// `infer` covers the common signatures; an `ftyp` box at offset 4 is
/// accepted as mp4-family even when the brand is exotic.
pub fn sniff_source_label(first_bytes: &[u8]) -> Option<&'static str> {
    if let Some(kind) = infer::get(first_bytes) {
        let mime = kind.mime_type();
        if lookup(mime).is_some() {
            return Some(match mime {
                "video/quicktime" => "video/quicktime",
                m if m.starts_with("image/png") => "image/png",
                m if m.starts_with("image/jpeg") => "image/jpeg",
                m if m.starts_with("image/gif") => "image/gif",
                m if m.starts_with("image/tiff") => "image/tiff",
                _ => "video/mp4",
            });
        }
    }
    if first_bytes.len() >= 8 && &first_bytes[4..8] == b"ftyp" {
        return Some("video/mp4");
    }
    None
}
