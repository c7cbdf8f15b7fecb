use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors raised by [`EngineConfig::validate`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Naming scheme for numbered segment files inside a transcoded version
///
/// Segments are named `<prefix><zero-padded serial>`; a serial is rejected
/// once it no longer fits in `max_serial_digits`.
#[derive(Debug, Clone)]
pub struct SegmentNaming {
    pub prefix: String,
    pub max_serial_digits: usize,
}

impl Default for SegmentNaming {
    fn default() -> Self {
        SegmentNaming {
            prefix: "data_seg_".to_string(),
            max_serial_digits: 4,
        }
    }
}

/// Engine configuration shared by the orchestrator, the cache layer and the
/// file processors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the local staging area used while a job is transcoding
    pub tmp_dir: PathBuf,
    /// Root of the on-disk content cache (`<cache_dir>/cached/<doc-id>/...`)
    pub cache_dir: PathBuf,
    /// Buffer size for chunked reads/writes during segment transfer
    pub transfer_buffer_bytes: usize,
    /// Buffer size for cache population / cached reads
    pub cache_buffer_bytes: usize,
    /// Rotate the resource key file once it is older than this many seconds
    pub keyfile_update_interval_secs: u64,
    /// Required length of a version label (printable alphanumeric)
    pub version_label_len: usize,
    pub segment_naming: SegmentNaming,
    /// Nominal duration of one HLS segment, used for playlist composition
    pub hls_segment_duration_secs: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("medley");
        EngineConfig {
            tmp_dir: base.join("staging"),
            cache_dir: base,
            transfer_buffer_bytes: 128 * 1024,
            cache_buffer_bytes: 64 * 1024,
            keyfile_update_interval_secs: 3600,
            version_label_len: 2,
            segment_naming: SegmentNaming::default(),
            hls_segment_duration_secs: 10.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_buffer_bytes == 0 || self.cache_buffer_bytes == 0 {
            return Err(ConfigError::Config(
                "buffer sizes must be nonzero".to_string(),
            ));
        }
        if self.segment_naming.max_serial_digits == 0 {
            return Err(ConfigError::Config(
                "segment serial width must be nonzero".to_string(),
            ));
        }
        if self.version_label_len == 0 {
            return Err(ConfigError::Config(
                "version label length must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
