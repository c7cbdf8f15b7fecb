//! Per-job orchestration.
//!
//! One RPC job wires a single source processor to N destination processors
//! and drives them through setup, cooperative processing, commit and
//! teardown. Progress and terminal results flow to the caller as
//! [`JobEvent`]s over an unbounded channel; the RPC adapter turns those into
//! reply messages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::remove_dir_recursive;
use crate::config::EngineConfig;
use crate::keystore::{KeyEntry, KeyManager, KeystoreError, MOST_RECENT_KEY_ID};
use crate::processor::{
    lookup, open_source_chunk, sniff_source_label, CodecBackend, DestinationProcessor,
    HlsDestination, HlsDestinationParams, ImageDestination, ImageDestinationParams, ImageSource,
    Mp4Source, ProcessorError, ProcessorKind, SourceProcessor, SOURCE_SNIFF_BYTES,
};
use crate::rpc::{
    validate_version_label, ErrorDomain, ErrorInfo, JobEvent, OutputSpec, RequestError,
    ResourceKey, StoredVersionAttrs, TranscodeRequest,
};
use crate::storage::{LocalStorage, StorageBackend, StorageError, StorageRegistry};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("unknown storage alias: {0}")]
    UnknownStorage(String),
    #[error("unsupported container: {0}")]
    UnsupportedContainer(String),
    #[error("source format not recognized")]
    UnsupportedSource,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

impl JobError {
    fn write_into(&self, err: &mut ErrorInfo) {
        match self {
            JobError::Invalid(_) | JobError::Request(_) => {
                err.set(ErrorDomain::NonField, self.to_string())
            }
            JobError::UnknownStorage(_) | JobError::Storage(_) => {
                err.set(ErrorDomain::Storage, self.to_string())
            }
            JobError::UnsupportedContainer(_)
            | JobError::UnsupportedSource
            | JobError::Keystore(_) => err.set(ErrorDomain::Transcoder, self.to_string()),
            JobError::Processor(e) => e.write_into(err),
        }
    }
}

struct DestEntry {
    processor: Box<dyn DestinationProcessor>,
    working: bool,
}

/// Bounded set of destination processors with explicit working flags.
///
/// Capacity is fixed at construction from the requested output count;
/// removal compacts the array. `all_stopped` is the re-entry condition the
/// orchestrator checks before stepping the source or committing.
pub struct DestinationSet {
    entries: Vec<DestEntry>,
    capacity: usize,
}

impl DestinationSet {
    pub fn new(capacity: usize) -> Self {
        DestinationSet {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, processor: Box<dyn DestinationProcessor>) -> Result<(), JobError> {
        if self.entries.len() >= self.capacity {
            return Err(JobError::Invalid(
                "destination set is at capacity".to_string(),
            ));
        }
        self.entries.push(DestEntry {
            processor,
            working: false,
        });
        Ok(())
    }

    /// Remove by version label, compacting the set. True when found.
    pub fn remove(&mut self, version: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.processor.version() != version);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all_stopped(&self) -> bool {
        self.entries.iter().all(|e| !e.working)
    }

    pub fn all_done(&self) -> bool {
        self.entries.iter().all(|e| e.processor.has_done_processing())
    }

    fn set_working(&mut self, idx: usize, value: bool) {
        if let Some(entry) = self.entries.get_mut(idx) {
            entry.working = value;
        }
    }

    fn processors_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut Box<dyn DestinationProcessor>> + '_ {
        self.entries.iter_mut().map(|e| &mut e.processor)
    }
}

/// Pre-job dedup against the stored version table.
///
/// An output whose attributes match a published row is dropped (nothing to
/// retranscode); an output whose attributes differ is flagged as an update
/// so the commit layer retires the previous version. Returns the dropped
/// version labels.
pub fn dedup_outputs(
    request: &mut TranscodeRequest,
    known_versions: &[StoredVersionAttrs],
) -> Vec<String> {
    let mut dropped = Vec::new();
    for row in known_versions {
        let Some(output) = request.outputs.get(&row.version) else {
            continue;
        };
        let Some(attrs) = resolve_video_attrs(request, output) else {
            continue;
        };
        let unchanged = attrs.0 == row.height_pixel
            && attrs.1 == row.width_pixel
            && attrs.2 == row.framerate;
        if unchanged {
            request.outputs.remove(&row.version);
            dropped.push(row.version.clone());
        } else if let Some(output) = request.outputs.get_mut(&row.version) {
            output.internal.is_update = true;
        }
    }
    dropped
}

/// (height, width, framerate) of the video stream an output references
fn resolve_video_attrs(
    request: &TranscodeRequest,
    output: &OutputSpec,
) -> Option<(u16, u16, u8)> {
    let key = output
        .internal
        .video_key
        .clone()
        .or_else(|| {
            output
                .elementary_streams
                .iter()
                .find(|k| {
                    request
                        .elementary_streams
                        .get(*k)
                        .map(|s| s.kind == "video")
                        .unwrap_or(false)
                })
                .cloned()
        })?;
    let stream = request.elementary_streams.get(&key)?;
    let attrs = &stream.attribute;
    Some((attrs.height_pixel, attrs.width_pixel, attrs.framerate))
}

/// Shared engine state one job runner is built from
#[derive(Clone)]
pub struct JobRunner {
    config: EngineConfig,
    storages: StorageRegistry,
    local: Arc<dyn StorageBackend>,
    codec: Arc<dyn CodecBackend>,
    keys: Arc<KeyManager>,
}

impl JobRunner {
    pub fn new(
        config: EngineConfig,
        storages: StorageRegistry,
        codec: Arc<dyn CodecBackend>,
        keys: Arc<KeyManager>,
    ) -> Self {
        let local: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.tmp_dir));
        JobRunner {
            config,
            storages,
            local,
            codec,
            keys,
        }
    }

    /// Run one job in the background; consume the returned events to track
    /// progress and the terminal result.
    pub fn submit(
        &self,
        request: TranscodeRequest,
        known_versions: Vec<StoredVersionAttrs>,
    ) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_job(request, known_versions, tx).await;
        });
        rx
    }

    async fn run_job(
        &self,
        mut request: TranscodeRequest,
        known_versions: Vec<StoredVersionAttrs>,
        tx: mpsc::UnboundedSender<JobEvent>,
    ) {
        if let Err(e) = self.validate(&request) {
            let mut err = ErrorInfo::new();
            e.write_into(&mut err);
            let _ = tx.send(JobEvent::Failed { error: err });
            return;
        }

        let dropped = dedup_outputs(&mut request, &known_versions);
        for version in dropped {
            let _ = tx.send(JobEvent::VersionSkipped { version });
        }
        let mut versions: Vec<String> = request.outputs.keys().cloned().collect();
        versions.sort();
        let _ = tx.send(JobEvent::Started {
            versions: versions.clone(),
        });
        if versions.is_empty() {
            // every requested output is already published
            let _ = tx.send(JobEvent::completed());
            return;
        }

        match self.drive(&request, &versions, &tx).await {
            Ok(()) => {
                info!(versions = versions.len(), "transcode job finished");
                let _ = tx.send(JobEvent::completed());
            }
            Err(e) => {
                warn!(error = %e, "transcode job failed");
                let mut err = ErrorInfo::new();
                e.write_into(&mut err);
                let _ = tx.send(JobEvent::Failed { error: err });
            }
        }
    }

    fn validate(&self, request: &TranscodeRequest) -> Result<(), JobError> {
        request.resource_key()?;
        if request.outputs.is_empty() {
            return Err(JobError::Invalid("no outputs requested".to_string()));
        }
        if request.parts_size.is_empty() {
            return Err(JobError::Invalid(
                "parts_size declares no source chunks".to_string(),
            ));
        }
        for (version, output) in &request.outputs {
            validate_version_label(version, self.config.version_label_len)?;
            for key in &output.elementary_streams {
                if !request.elementary_streams.contains_key(key) {
                    return Err(JobError::Request(RequestError::UnknownStreamKey(
                        key.clone(),
                    )));
                }
            }
        }
        Ok(())
    }

    async fn acquire_key(&self, resource: &ResourceKey) -> Result<(String, KeyEntry), JobError> {
        // contenders losing the rotation race still read a usable store
        let _ = self
            .keys
            .rotate_if_due(resource, self.config.keyfile_update_interval_secs)
            .await?;
        let store = self.keys.load(resource).await?;
        let (id, entry) = store
            .get_key(MOST_RECENT_KEY_ID)
            .ok_or_else(|| JobError::Invalid("no usable crypto key".to_string()))?;
        Ok((id.to_string(), entry.clone()))
    }

    async fn drive(
        &self,
        request: &TranscodeRequest,
        versions: &[String],
        tx: &mpsc::UnboundedSender<JobEvent>,
    ) -> Result<(), JobError> {
        let resource = request.resource_key()?;
        let src_storage = self
            .storages
            .get(&request.storage_alias)
            .ok_or_else(|| JobError::UnknownStorage(request.storage_alias.clone()))?;
        let resource_dir = PathBuf::from(resource.dir_name());
        let staging_root = PathBuf::from(format!("job-{}", Uuid::new_v4()));

        // setup barrier: staging dir and source preamble complete before any
        // processor is instantiated
        let preamble = {
            let mkdir = self.local.mkdir_p(&staging_root, true);
            let sniff = read_source_preamble(&src_storage, &resource_dir);
            let (_, preamble) = tokio::try_join!(mkdir, sniff)?;
            preamble
        };

        let mut source = self.instantiate_source(&src_storage, &resource_dir, request, &preamble)?;
        let mut dests = DestinationSet::new(versions.len());
        let result = self
            .drive_inner(request, versions, &resource, &staging_root, &mut source, &mut dests, tx)
            .await;
        self.teardown(&mut source, &mut dests, &staging_root).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_inner(
        &self,
        request: &TranscodeRequest,
        versions: &[String],
        resource: &ResourceKey,
        staging_root: &Path,
        source: &mut Box<dyn SourceProcessor>,
        dests: &mut DestinationSet,
        tx: &mpsc::UnboundedSender<JobEvent>,
    ) -> Result<(), JobError> {
        let needs_key = versions.iter().any(|v| {
            request
                .outputs
                .get(v)
                .and_then(|o| lookup(&o.container))
                .map(|e| e.kind == ProcessorKind::HlsDestination)
                .unwrap_or(false)
        });
        let crypto = if needs_key {
            Some(self.acquire_key(resource).await?)
        } else {
            None
        };

        for version in versions {
            let output = &request.outputs[version];
            let processor = self.instantiate_destination(
                request,
                resource,
                staging_root,
                version,
                output,
                crypto.as_ref(),
            )?;
            dests.add(processor)?;
        }

        source.init().await?;
        for dst in dests.processors_mut() {
            dst.init().await?;
        }

        let total_bytes: u64 = request.parts_size.iter().sum();
        let mut last_percent = -1.0f64;
        loop {
            // the source only steps while every destination is stopped
            debug_assert!(dests.all_stopped());
            if !source.has_done_processing() {
                source.process().await?;
                let frames = source.take_frames();
                if !frames.is_empty() {
                    for dst in dests.processors_mut() {
                        dst.accept_frames(&frames);
                    }
                }
            } else {
                for dst in dests.processors_mut() {
                    dst.end_of_input();
                }
            }

            for idx in 0..dests.len() {
                if dests.entries[idx].processor.has_done_processing() {
                    continue;
                }
                dests.set_working(idx, true);
                let step = dests.entries[idx].processor.process().await;
                dests.set_working(idx, false);
                step?;
            }

            let percent = if total_bytes == 0 {
                1.0
            } else {
                (source.bytes_consumed() as f64 / total_bytes as f64).min(1.0)
            };
            if percent - last_percent >= 0.01 {
                last_percent = percent;
                let _ = tx.send(JobEvent::progress(percent));
            }

            if source.has_done_processing() && dests.all_done() {
                break;
            }
        }

        debug_assert!(dests.all_stopped());
        for dst in dests.processors_mut() {
            dst.commit().await?;
            debug!(version = dst.version(), nbytes = dst.bytes_written(), "version committed");
            let _ = tx.send(JobEvent::VersionCommitted {
                version: dst.version().to_string(),
            });
        }
        Ok(())
    }

    fn instantiate_source(
        &self,
        src_storage: &Arc<dyn StorageBackend>,
        resource_dir: &Path,
        request: &TranscodeRequest,
        preamble: &[u8],
    ) -> Result<Box<dyn SourceProcessor>, JobError> {
        let label = sniff_source_label(preamble).ok_or(JobError::UnsupportedSource)?;
        let entry = lookup(label).ok_or(JobError::UnsupportedSource)?;
        let source: Box<dyn SourceProcessor> = match entry.kind {
            ProcessorKind::VideoSource => Box::new(Mp4Source::new(
                src_storage.clone(),
                resource_dir,
                request.parts_size.clone(),
                self.codec.new_decoder(),
                self.config.transfer_buffer_bytes,
            )),
            ProcessorKind::ImageSource => Box::new(ImageSource::new(
                src_storage.clone(),
                resource_dir,
                request.parts_size.clone(),
                self.codec.new_decoder(),
                self.config.transfer_buffer_bytes,
            )),
            _ => return Err(JobError::UnsupportedSource),
        };
        debug!(label, "source processor selected");
        Ok(source)
    }

    fn instantiate_destination(
        &self,
        request: &TranscodeRequest,
        resource: &ResourceKey,
        staging_root: &Path,
        version: &str,
        output: &OutputSpec,
        crypto: Option<&(String, KeyEntry)>,
    ) -> Result<Box<dyn DestinationProcessor>, JobError> {
        let alias = if output.storage_alias.is_empty() {
            &request.storage_alias
        } else {
            &output.storage_alias
        };
        let dest = self
            .storages
            .get(alias)
            .ok_or_else(|| JobError::UnknownStorage(alias.clone()))?;
        let entry = lookup(&output.container)
            .ok_or_else(|| JobError::UnsupportedContainer(output.container.clone()))?;
        let local_base = staging_root.join(version);

        let processor: Box<dyn DestinationProcessor> = match entry.kind {
            ProcessorKind::HlsDestination => {
                let (key_id, key_entry) = crypto
                    .cloned()
                    .ok_or_else(|| JobError::Invalid("no usable crypto key".to_string()))?;
                let resolution = resolve_video_attrs(request, output)
                    .filter(|(h, w, _)| *h > 0 && *w > 0)
                    .map(|(h, w, _)| (w, h));
                Box::new(HlsDestination::new(HlsDestinationParams {
                    resource: *resource,
                    version: version.to_string(),
                    is_update: output.internal.is_update,
                    local: self.local.clone(),
                    local_base,
                    dest,
                    naming: self.config.segment_naming.clone(),
                    transfer_buffer_bytes: self.config.transfer_buffer_bytes,
                    encoder: self.codec.new_encoder(&output.container),
                    key_id,
                    key_entry,
                    segment_duration_secs: self.config.hls_segment_duration_secs,
                    resolution,
                }))
            }
            ProcessorKind::ImageDestination => {
                Box::new(ImageDestination::new(ImageDestinationParams {
                    resource: *resource,
                    version: version.to_string(),
                    is_update: output.internal.is_update,
                    container: output.container.clone(),
                    local: self.local.clone(),
                    local_base,
                    dest,
                    transfer_buffer_bytes: self.config.transfer_buffer_bytes,
                    encoder: self.codec.new_encoder(&output.container),
                }))
            }
            _ => return Err(JobError::UnsupportedContainer(output.container.clone())),
        };
        Ok(processor)
    }

    /// Close everything a job opened: deinit may signal further cycles, so
    /// loop each processor until it reports complete, then drop the staging
    /// directory.
    async fn teardown(
        &self,
        source: &mut Box<dyn SourceProcessor>,
        dests: &mut DestinationSet,
        staging_root: &Path,
    ) {
        loop {
            match source.deinit().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "source teardown error");
                    break;
                }
            }
        }
        for dst in dests.processors_mut() {
            loop {
                match dst.deinit().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        warn!(error = %e, "destination teardown error");
                        break;
                    }
                }
            }
        }
        if let Err(e) = remove_dir_recursive(&self.local, staging_root).await {
            debug!(error = %e, "staging root already gone");
        }
    }
}

/// Open the first source chunk and read the bytes MIME sniffing needs
async fn read_source_preamble(
    storage: &Arc<dyn StorageBackend>,
    resource_dir: &Path,
) -> Result<Vec<u8>, StorageError> {
    let mut file = open_source_chunk(storage, resource_dir, 0).await?;
    let mut buf = vec![0u8; SOURCE_SNIFF_BYTES];
    let mut filled = 0usize;
    while filled < buf.len() {
        let nread = file.read(&mut buf[filled..]).await?;
        if nread == 0 {
            break;
        }
        filled += nread;
    }
    buf.truncate(filled);
    Ok(buf)
}
