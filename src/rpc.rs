//! Typed views of the RPC job boundary.
//!
//! The broker integration itself lives outside this crate; these are the
//! payload records a consumer hands to the orchestrator and the event stream
//! it gets back. Frequently-used fields are lifted into typed structs, raw
//! JSON survives only in the per-stream attribute bags.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Identifies one ingested source file across every storage backend.
///
/// Both ids are nonzero; the on-disk namespace is `<usr_id>/<08x upld_req_id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub usr_id: u32,
    pub upld_req_id: u32,
}

impl ResourceKey {
    pub fn new(usr_id: u32, upld_req_id: u32) -> Result<Self, RequestError> {
        if usr_id == 0 || upld_req_id == 0 {
            return Err(RequestError::InvalidResourceKey);
        }
        Ok(ResourceKey {
            usr_id,
            upld_req_id,
        })
    }

    /// Relative directory of this resource under a storage root
    pub fn dir_name(&self) -> String {
        format!("{}/{:08x}", self.usr_id, self.upld_req_id)
    }

    /// Canonical plaintext encrypted into a document id
    pub fn doc_plaintext(&self) -> String {
        format!("{}/{:08x}", self.usr_id, self.upld_req_id)
    }
}

/// Validate a version label: printable alphanumeric, exact configured length
pub fn validate_version_label(label: &str, expect_len: usize) -> Result<(), RequestError> {
    if label.len() != expect_len || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(RequestError::InvalidVersionLabel(label.to_string()));
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("user id and upload request id must be nonzero")]
    InvalidResourceKey,
    #[error("invalid version label: {0}")]
    InvalidVersionLabel(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unknown elementary stream key: {0}")]
    UnknownStreamKey(String),
}

/// One entry of the `elementary_streams` map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementaryStream {
    #[serde(rename = "type")]
    pub kind: String,
    pub codec: String,
    #[serde(default)]
    pub attribute: StreamAttributes,
}

/// Attribute bag of one elementary stream. Video fields are lifted because
/// the version dedup check compares them; everything else stays loose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamAttributes {
    #[serde(default)]
    pub height_pixel: u16,
    #[serde(default)]
    pub width_pixel: u16,
    #[serde(default)]
    pub framerate: u8,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Fields the engine maintains on an output while the job runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputInternal {
    #[serde(default)]
    pub is_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_key: Option<String>,
}

/// One requested output version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub container: String,
    #[serde(default)]
    pub elementary_streams: Vec<String>,
    #[serde(default)]
    pub storage_alias: String,
    #[serde(default, rename = "__internal__")]
    pub internal: OutputInternal,
}

/// The transcode job payload as consumed from the job queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub usr_id: u32,
    pub last_upld_req: u32,
    #[serde(default)]
    pub metadata_db: String,
    #[serde(default)]
    pub storage_alias: String,
    pub outputs: HashMap<String, OutputSpec>,
    #[serde(default)]
    pub elementary_streams: HashMap<String, ElementaryStream>,
    #[serde(default)]
    pub parts_size: Vec<u64>,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub res_id_encoded: String,
}

impl TranscodeRequest {
    pub fn resource_key(&self) -> Result<ResourceKey, RequestError> {
        ResourceKey::new(self.usr_id, self.last_upld_req)
    }
}

/// Attributes of an already-published version, as read back from the
/// version metadata table. Input to the pre-job dedup check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVersionAttrs {
    pub version: String,
    pub height_pixel: u16,
    pub width_pixel: u16,
    pub framerate: u8,
}

/// Error domains surfaced at the system boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    Storage,
    Transcode,
    Transcoder,
    Model,
    NonField,
}

impl ErrorDomain {
    fn key(&self) -> &'static str {
        match self {
            ErrorDomain::Storage => "storage",
            ErrorDomain::Transcode => "transcode",
            ErrorDomain::Transcoder => "transcoder",
            ErrorDomain::Model => "model",
            ErrorDomain::NonField => "non-field",
        }
    }
}

/// The shared error object every component writes into before yielding.
///
/// Serializes to the boundary JSON taxonomy:
/// `{storage|transcode|transcoder|model|non-field: <reason>, _http_resp_code: <u16>}`
#[derive(Debug, Clone, Default)]
pub struct ErrorInfo {
    entries: Vec<(ErrorDomain, String)>,
    http_resp_code: Option<u16>,
}

impl ErrorInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, domain: ErrorDomain, reason: impl Into<String>) {
        self.entries.push((domain, reason.into()));
    }

    pub fn set_http_resp_code(&mut self, code: u16) {
        self.http_resp_code = Some(code);
    }

    pub fn http_resp_code(&self) -> Option<u16> {
        self.http_resp_code
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, domain: ErrorDomain) -> Option<&str> {
        self.entries
            .iter()
            .find(|(d, _)| *d == domain)
            .map(|(_, r)| r.as_str())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (domain, reason) in &self.entries {
            map.entry(domain.key())
                .or_insert_with(|| serde_json::Value::String(reason.clone()));
        }
        if let Some(code) = self.http_resp_code {
            map.insert("_http_resp_code".to_string(), code.into());
        }
        serde_json::Value::Object(map)
    }
}

/// Progress and terminal events of one transcode job.
///
/// The RPC adapter serializes these into reply messages tagged by job id;
/// a successful job ends with `Completed` (`percent_done == 1.0, done=true`),
/// a failed one with `Failed` carrying the boundary error object.
#[derive(Debug)]
pub enum JobEvent {
    /// Intake accepted; lists the versions that will actually transcode
    /// (outputs dropped by the dedup check are already gone).
    Started { versions: Vec<String> },
    /// A version was dropped pre-init because a published version with the
    /// same attributes already exists.
    VersionSkipped { version: String },
    Progress { percent_done: f64, timestamp: i64 },
    VersionCommitted { version: String },
    Completed { percent_done: f64, done: bool },
    Failed { error: ErrorInfo },
}

impl JobEvent {
    pub fn progress(percent_done: f64) -> Self {
        JobEvent::Progress {
            percent_done,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn completed() -> Self {
        JobEvent::Completed {
            percent_done: 1.0,
            done: true,
        }
    }

    /// Reply body the RPC adapter publishes for this event, tagged by the
    /// job id at the broker layer.
    pub fn to_reply_json(&self) -> serde_json::Value {
        match self {
            JobEvent::Started { versions } => serde_json::json!({"versions": versions}),
            JobEvent::VersionSkipped { version } => {
                serde_json::json!({"skipped": version})
            }
            JobEvent::Progress {
                percent_done,
                timestamp,
            } => serde_json::json!({"percent_done": percent_done, "timestamp": timestamp}),
            JobEvent::VersionCommitted { version } => {
                serde_json::json!({"version": version, "committed": true})
            }
            JobEvent::Completed {
                percent_done,
                done,
            } => serde_json::json!({"percent_done": percent_done, "done": done}),
            JobEvent::Failed { error } => serde_json::json!({"error": error.to_json()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_rejects_zero_ids() {
        assert!(ResourceKey::new(0, 5).is_err());
        assert!(ResourceKey::new(5, 0).is_err());
        let key = ResourceKey::new(127, 0x2a).unwrap();
        assert_eq!(key.dir_name(), "127/0000002a");
    }

    #[test]
    fn version_label_must_be_alphanumeric_fixed_len() {
        assert!(validate_version_label("v1", 2).is_ok());
        assert!(validate_version_label("v", 2).is_err());
        assert!(validate_version_label("v12", 2).is_err());
        assert!(validate_version_label("v/", 2).is_err());
    }

    #[test]
    fn error_info_keeps_first_reason_per_domain() {
        let mut err = ErrorInfo::new();
        err.set(ErrorDomain::Storage, "disk gone");
        err.set(ErrorDomain::Storage, "later noise");
        err.set_http_resp_code(409);
        let value = err.to_json();
        assert_eq!(value["storage"], "disk gone");
        assert_eq!(value["_http_resp_code"], 409);
    }

    #[test]
    fn reply_bodies_follow_the_queue_contract() {
        let done = JobEvent::completed().to_reply_json();
        assert_eq!(done["percent_done"], 1.0);
        assert_eq!(done["done"], true);

        let progress = JobEvent::progress(0.25).to_reply_json();
        assert_eq!(progress["percent_done"], 0.25);
        assert!(progress["timestamp"].is_i64());

        let mut err = ErrorInfo::new();
        err.set(ErrorDomain::Transcode, "filter graph failed");
        let failed = JobEvent::Failed { error: err }.to_reply_json();
        assert_eq!(failed["error"]["transcode"], "filter graph failed");
    }

    #[test]
    fn request_parses_boundary_payload() {
        let raw = serde_json::json!({
            "usr_id": 95,
            "last_upld_req": 0x9f001234u32,
            "storage_alias": "localfs",
            "outputs": {
                "Dk": {
                    "container": "hls",
                    "elementary_streams": ["video-0", "audio-0"],
                    "storage_alias": "localfs",
                    "__internal__": {"is_update": false, "video_key": "video-0"}
                }
            },
            "elementary_streams": {
                "video-0": {
                    "type": "video",
                    "codec": "libx264",
                    "attribute": {"height_pixel": 720, "width_pixel": 1280, "framerate": 24}
                }
            },
            "parts_size": [1024, 512]
        });
        let req: TranscodeRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.outputs["Dk"].container, "hls");
        assert_eq!(
            req.elementary_streams["video-0"].attribute.height_pixel,
            720
        );
        assert_eq!(req.resource_key().unwrap().usr_id, 95);
    }
}
