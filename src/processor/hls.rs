//! HLS destination processor and its streaming counterpart.
//!
//! The transcode role consumes decoded frames, cuts numbered fMP4 segments,
//! encrypts each one with the job's key (AES-128-CBC, the only cipher
//! RFC 8216 admits), stages everything locally and moves it to the
//! destination storage before the staged commit publishes the version.
//!
//! The streaming role is the resident processor behind the cache layer: it
//! composes the master playlist across committed versions, serves level-2
//! playlists, the init packet map, encrypted segments and the key-request
//! payload block-by-block.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::codec::{Encoder, MediaFrame};
use super::{CacheSource, DataBlock, DestinationProcessor, FileProcessor, ProcessorError};
use crate::commit::{CommitManager, COMMITTED_DIR, TRANSCODING_DIR};
use crate::config::SegmentNaming;
use crate::keystore::{self, CacheMetadata, KeyEntry, KeyManager, KeyStore};
use crate::rpc::ResourceKey;
use crate::storage::{EntryKind, StorageBackend, StorageFile, WriteMode};
use crate::transfer::{segment_filename, SegmentTransfer, TransferredFiles};

pub const HLS_MASTER_PLAYLIST_FILENAME: &str = "mst_plist.m3u8";
pub const HLS_PLAYLIST_FILENAME: &str = "lvl2_plist.m3u8";
pub const HLS_FMP4_FILENAME: &str = "init_packet_map";
pub const HLS_KEY_REQUEST_LABEL: &str = "key_request";

/// Max bytes the formatted EXT-X-TARGETDURATION value may occupy
pub const HLS_PLIST_TARGET_DURATION_MAX_BYTES: usize = 15;

pub struct HlsDestinationParams {
    pub resource: ResourceKey,
    pub version: String,
    pub is_update: bool,
    /// Staging backend (local tmp) and the version's staging dir within it
    pub local: Arc<dyn StorageBackend>,
    pub local_base: PathBuf,
    pub dest: Arc<dyn StorageBackend>,
    pub naming: SegmentNaming,
    pub transfer_buffer_bytes: usize,
    pub encoder: Box<dyn Encoder>,
    pub key_id: String,
    pub key_entry: KeyEntry,
    /// Nominal duration of one segment, used for playlist composition
    pub segment_duration_secs: f32,
    pub resolution: Option<(u16, u16)>,
}

pub struct HlsDestination {
    resource: ResourceKey,
    version: String,
    is_update: bool,
    local: Arc<dyn StorageBackend>,
    local_base: PathBuf,
    commit: CommitManager,
    transfer: SegmentTransfer,
    naming: SegmentNaming,
    encoder: Box<dyn Encoder>,
    key_id: String,
    key_entry: KeyEntry,
    segment_duration_secs: f32,
    resolution: Option<(u16, u16)>,

    pending: Vec<MediaFrame>,
    seg_buffers: HashMap<u32, Vec<u8>>,
    ready: Vec<u32>,
    segments_written: Vec<u32>,
    files: TransferredFiles,
    bytes_written: u64,
    end_of_input: bool,
    encoder_flushed: bool,
    done: bool,
    deinit_stage: u8,
}

impl HlsDestination {
    pub fn new(params: HlsDestinationParams) -> Self {
        let dest_base =
            CommitManager::version_dir(&params.resource, TRANSCODING_DIR, &params.version);
        let transfer = SegmentTransfer::new(
            params.local.clone(),
            params.local_base.clone(),
            params.dest.clone(),
            dest_base,
            params.transfer_buffer_bytes,
        );
        HlsDestination {
            resource: params.resource,
            version: params.version,
            is_update: params.is_update,
            local: params.local,
            local_base: params.local_base,
            commit: CommitManager::new(params.dest),
            transfer,
            naming: params.naming,
            encoder: params.encoder,
            key_id: params.key_id,
            key_entry: params.key_entry,
            segment_duration_secs: params.segment_duration_secs,
            resolution: params.resolution,
            pending: Vec::new(),
            seg_buffers: HashMap::new(),
            ready: Vec::new(),
            segments_written: Vec::new(),
            files: TransferredFiles::new(),
            bytes_written: 0,
            end_of_input: false,
            encoder_flushed: false,
            done: false,
            deinit_stage: 0,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    async fn write_local(&self, name: &str, data: &[u8]) -> Result<(), ProcessorError> {
        let path = self.local_base.join(name);
        let mut file = self.local.open_write(&path, WriteMode::Truncate).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn handle_encoded(
        &mut self,
        chunks: Vec<super::codec::EncodedChunk>,
    ) -> Result<(), ProcessorError> {
        for chunk in chunks {
            let buffer = self.seg_buffers.entry(chunk.segment_serial).or_default();
            buffer.extend_from_slice(&chunk.data);
            if chunk.segment_complete {
                let payload = self
                    .seg_buffers
                    .remove(&chunk.segment_serial)
                    .unwrap_or_default();
                let encrypted = keystore::encrypt_payload(&self.key_entry, &payload)?;
                let filename = segment_filename(&self.naming, chunk.segment_serial)?;
                self.write_local(&filename, &encrypted).await?;
                self.segments_written.push(chunk.segment_serial);
                self.ready.push(chunk.segment_serial);
                debug!(
                    version = %self.version,
                    serial = chunk.segment_serial,
                    nbytes = encrypted.len(),
                    "segment staged"
                );
            }
        }
        Ok(())
    }

    /// Move every staged segment to the destination storage
    async fn flush_ready(&mut self) -> Result<(), ProcessorError> {
        let ready = std::mem::take(&mut self.ready);
        let mut idx = 0usize;
        while let Some(nbytes) = self
            .transfer
            .transfer_segment(&self.naming, &ready, idx, &mut self.files)
            .await?
        {
            self.bytes_written += nbytes;
            idx += 1;
        }
        Ok(())
    }

    fn target_duration_tag(&self) -> Result<String, ProcessorError> {
        let value = format!("{}", self.segment_duration_secs.ceil() as u32);
        if value.len() > HLS_PLIST_TARGET_DURATION_MAX_BYTES {
            return Err(ProcessorError::Transcode(
                "target duration does not fit playlist tag".to_string(),
            ));
        }
        Ok(value)
    }

    fn build_media_playlist(&self) -> Result<String, ProcessorError> {
        let mut text = String::new();
        text.push_str("#EXTM3U\n#EXT-X-VERSION:7\n");
        text.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n",
            self.target_duration_tag()?
        ));
        text.push_str("#EXT-X-MEDIA-SEQUENCE:1\n#EXT-X-PLAYLIST-TYPE:VOD\n");
        text.push_str(&format!("#EXT-X-MAP:URI=\"{HLS_FMP4_FILENAME}\"\n"));
        text.push_str(&format!(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"{HLS_KEY_REQUEST_LABEL}\",IV=0x{}\n",
            self.key_entry.iv.data
        ));
        let mut serials = self.segments_written.clone();
        serials.sort_unstable();
        for serial in serials {
            let filename = segment_filename(&self.naming, serial)?;
            text.push_str(&format!("#EXTINF:{:.1},\n", self.segment_duration_secs));
            text.push_str(&filename);
            text.push('\n');
        }
        text.push_str("#EXT-X-ENDLIST\n");
        Ok(text)
    }

    fn build_master_playlist(&self) -> String {
        let mut text = String::new();
        text.push_str("#EXTM3U\n#EXT-X-VERSION:7\n");
        let bandwidth = estimate_bandwidth(
            self.bytes_written,
            self.segments_written.len(),
            self.segment_duration_secs,
        );
        match self.resolution {
            Some((width, height)) => text.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION={width}x{height}\n"
            )),
            None => text.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={bandwidth}\n")),
        }
        text.push_str(HLS_PLAYLIST_FILENAME);
        text.push('\n');
        text
    }
}

fn estimate_bandwidth(total_bytes: u64, segments: usize, segment_duration_secs: f32) -> u64 {
    let duration = (segments.max(1) as f32) * segment_duration_secs.max(0.1);
    ((total_bytes.max(1) * 8) as f32 / duration) as u64
}

#[async_trait::async_trait]
impl FileProcessor for HlsDestination {
    async fn init(&mut self) -> Result<(), ProcessorError> {
        // staging dirs exist before any segment lands
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
                let chunks = self.encoder.encode(frame)?;
                self.handle_encoded(chunks).await?;
            }
            self.flush_ready().await?;
            return Ok(());
        }
        if self.end_of_input {
            if !self.encoder_flushed {
                let chunks = self.encoder.flush()?;
                self.encoder_flushed = true;
                self.handle_encoded(chunks).await?;
            }
            self.flush_ready().await?;
            self.done = true;
        }
        Ok(())
    }

    fn has_done_processing(&self) -> bool {
        self.done
    }

    async fn deinit(&mut self) -> Result<bool, ProcessorError> {
        match self.deinit_stage {
            0 => {
                self.pending.clear();
                self.seg_buffers.clear();
                self.ready.clear();
                self.deinit_stage = 1;
                Ok(true)
            }
            _ => {
                if let Err(e) =
                    crate::commit::remove_dir_recursive(&self.local, &self.local_base).await
                {
                    warn!(version = %self.version, error = %e, "staging dir left behind");
                }
                Ok(false)
            }
        }
    }
}

#[async_trait::async_trait]
impl DestinationProcessor for HlsDestination {
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
        let init_map = self.encoder.init_segment()?;
        self.write_local(HLS_FMP4_FILENAME, &init_map).await?;
        let media_playlist = self.build_media_playlist()?;
        self.write_local(HLS_PLAYLIST_FILENAME, media_playlist.as_bytes())
            .await?;
        let master_playlist = self.build_master_playlist();
        self.write_local(HLS_MASTER_PLAYLIST_FILENAME, master_playlist.as_bytes())
            .await?;

        for name in [
            HLS_FMP4_FILENAME,
            HLS_PLAYLIST_FILENAME,
            HLS_MASTER_PLAYLIST_FILENAME,
        ] {
            let nbytes = self.transfer.transfer_file(name, name, &mut self.files).await?;
            self.bytes_written += nbytes;
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

// ---------------------------------------------------------------------------
// streaming side
// ---------------------------------------------------------------------------

/// Parse a level-2 playlist: target duration and segment count.
/// Used while composing the master playlist across committed versions.
pub(crate) fn parse_media_playlist(text: &str) -> (u32, usize) {
    let mut target = 0u32;
    let mut segments = 0usize;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target = rest.trim().parse().unwrap_or(0);
        } else if line.starts_with("#EXTINF:") {
            segments += 1;
        }
    }
    (target, segments)
}

enum StreamContent {
    Inline { data: Vec<u8>, pos: usize },
    File { file: Box<dyn StorageFile> },
}

/// Resident cache processor for `video/hls` resources
pub struct HlsStream {
    dest: Arc<dyn StorageBackend>,
    key_manager: Arc<KeyManager>,
    resource: ResourceKey,
    metadata: CacheMetadata,
    detail: String,
    block_bytes: usize,
    keys: KeyStore,
    content: Option<StreamContent>,
    num_playlists_merged: u32,
}

impl HlsStream {
    pub fn new(
        dest: Arc<dyn StorageBackend>,
        key_manager: Arc<KeyManager>,
        metadata: CacheMetadata,
        detail: impl Into<String>,
        block_bytes: usize,
    ) -> Result<Self, ProcessorError> {
        let resource = ResourceKey::new(metadata.usr_id, metadata.upld_req)
            .map_err(|e| ProcessorError::Spec(e.to_string()))?;
        Ok(HlsStream {
            dest,
            key_manager,
            resource,
            metadata,
            detail: detail.into(),
            block_bytes: block_bytes.max(1),
            keys: KeyStore::default(),
            content: None,
            num_playlists_merged: 0,
        })
    }

    pub fn num_playlists_merged(&self) -> u32 {
        self.num_playlists_merged
    }

    async fn build_master(&mut self) -> Result<Vec<u8>, ProcessorError> {
        let commit = CommitManager::new(self.dest.clone());
        let committed = CommitManager::resource_dir(&self.resource).join(COMMITTED_DIR);
        let entries = self.dest.scandir(&committed).await?;
        let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:7\n");
        let mut versions: Vec<String> = entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .map(|e| e.name)
            .collect();
        versions.sort();
        for version in versions {
            let playlist_path = committed.join(&version).join(HLS_PLAYLIST_FILENAME);
            let Ok(body) = read_all(&self.dest, &playlist_path).await else {
                continue;
            };
            let playlist_text = String::from_utf8_lossy(&body);
            let (target, segments) = parse_media_playlist(&playlist_text);
            let total_bytes = commit
                .read_version_metadata(&self.resource, &version)
                .await
                .ok()
                .flatten()
                .map(|files| files.iter().map(|(_, r)| r.size).sum::<u64>())
                .unwrap_or(0);
            let bandwidth = estimate_bandwidth(total_bytes, segments, target.max(1) as f32);
            text.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={bandwidth}\n"));
            text.push_str(&format!("{version}/{HLS_PLAYLIST_FILENAME}\n"));
            self.num_playlists_merged += 1;
        }
        if self.num_playlists_merged == 0 {
            return Err(ProcessorError::Transcode(
                "no committed version carries a media playlist".to_string(),
            ));
        }
        Ok(text.into_bytes())
    }

    fn key_payload(&self) -> Result<Vec<u8>, ProcessorError> {
        let (_, entry) = self.keys.get_key(&self.metadata.key_id).ok_or_else(|| {
            ProcessorError::Transcode(format!("key {} not in key store", self.metadata.key_id))
        })?;
        hex::decode(&entry.key.data)
            .map_err(|e| ProcessorError::Transcode(format!("corrupt key material: {e}")))
    }
}

async fn read_all(
    storage: &Arc<dyn StorageBackend>,
    path: &std::path::Path,
) -> Result<Vec<u8>, ProcessorError> {
    let mut file = storage.open_read(path).await?;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let nread = file.read(&mut buf).await?;
        if nread == 0 {
            break;
        }
        out.extend_from_slice(&buf[..nread]);
    }
    Ok(out)
}

#[async_trait::async_trait]
impl CacheSource for HlsStream {
    async fn init(&mut self) -> Result<String, ProcessorError> {
        self.keys = self.key_manager.load(&self.resource).await?;
        let detail = self.detail.clone();
        let content = if detail == HLS_MASTER_PLAYLIST_FILENAME {
            let data = self.build_master().await?;
            StreamContent::Inline { data, pos: 0 }
        } else if detail == HLS_KEY_REQUEST_LABEL {
            let data = self.key_payload()?;
            StreamContent::Inline { data, pos: 0 }
        } else if let Some((version, element)) = detail.split_once('/') {
            let path = CommitManager::resource_dir(&self.resource)
                .join(COMMITTED_DIR)
                .join(version)
                .join(element);
            if element == HLS_PLAYLIST_FILENAME {
                let data = read_all(&self.dest, &path).await?;
                StreamContent::Inline { data, pos: 0 }
            } else {
                // init packet map or encrypted segment, streamed as stored
                let file = self.dest.open_read(&path).await?;
                StreamContent::File { file }
            }
        } else {
            return Err(ProcessorError::Transcode(format!(
                "unknown stream element: {detail}"
            )));
        };
        self.content = Some(content);
        Ok(detail)
    }

    async fn next_block(&mut self) -> Result<DataBlock, ProcessorError> {
        let block_bytes = self.block_bytes;
        match self.content.as_mut() {
            Some(StreamContent::Inline { data, pos }) => {
                let end = (*pos + block_bytes).min(data.len());
                let block = data[*pos..end].to_vec();
                *pos = end;
                Ok(DataBlock {
                    data: block,
                    is_final: end == data.len(),
                })
            }
            Some(StreamContent::File { file }) => {
                let mut buf = vec![0u8; block_bytes];
                let nread = file.read(&mut buf).await?;
                buf.truncate(nread);
                Ok(DataBlock {
                    data: buf,
                    is_final: nread < block_bytes,
                })
            }
            None => Err(ProcessorError::Transcode(
                "stream element not initialized".to_string(),
            )),
        }
    }

    async fn deinit(&mut self) -> Result<bool, ProcessorError> {
        self.content = None;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyMaterial;
    use crate::processor::codec::{CodecBackend, PassthroughCodec};
    use crate::storage::LocalStorage;

    fn key_entry() -> KeyEntry {
        KeyEntry {
            key: KeyMaterial {
                nbytes: 16,
                data: "1d2a07b4836c998e2a07b4836c939a08".to_string(),
            },
            iv: KeyMaterial {
                nbytes: 16,
                data: "e1d2a07b48360c991d2a07b48361c909".to_string(),
            },
            alg: "aes".to_string(),
            timestamp: Some(7),
        }
    }

    fn resource() -> ResourceKey {
        ResourceKey::new(126, 0xd101).unwrap()
    }

    fn destination(
        local_root: &std::path::Path,
        dest_root: &std::path::Path,
        version: &str,
        is_update: bool,
    ) -> HlsDestination {
        let local: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(local_root));
        let dest: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dest_root));
        HlsDestination::new(HlsDestinationParams {
            resource: resource(),
            version: version.to_string(),
            is_update,
            local,
            local_base: PathBuf::from(version),
            dest,
            naming: SegmentNaming::default(),
            transfer_buffer_bytes: 64,
            encoder: PassthroughCodec::new(16).new_encoder("hls"),
            key_id: "908e3873".to_string(),
            key_entry: key_entry(),
            segment_duration_secs: 10.0,
            resolution: Some((1280, 720)),
        })
    }

    async fn run_to_completion(dst: &mut HlsDestination, payload: &[u8]) {
        dst.init().await.unwrap();
        dst.accept_frames(&[MediaFrame {
            data: payload.to_vec(),
            keyframe: true,
        }]);
        dst.end_of_input();
        while !dst.has_done_processing() {
            dst.process().await.unwrap();
        }
        dst.commit().await.unwrap();
    }

    #[tokio::test]
    async fn publishes_segments_playlists_and_metadata() {
        let local = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let mut dst = destination(local.path(), dest.path(), "v1", false);
        run_to_completion(&mut dst, &[0xabu8; 40]).await;

        let committed = dest.path().join(resource().dir_name()).join("committed/v1");
        assert!(committed.join("data_seg_0001").is_file());
        assert!(committed.join("data_seg_0002").is_file());
        assert!(committed.join("data_seg_0003").is_file());
        assert!(committed.join(HLS_FMP4_FILENAME).is_file());
        assert!(committed.join("transcoded.json").is_file());

        // segments are encrypted: 40 plaintext bytes over 3 segments never
        // survive as raw payload
        let seg = std::fs::read(committed.join("data_seg_0001")).unwrap();
        assert_ne!(seg, vec![0xabu8; 16]);
        assert_eq!(seg.len() % 16, 0);
        let decrypted = keystore::decrypt_payload(&key_entry(), &seg).unwrap();
        assert_eq!(decrypted, vec![0xabu8; 16]);

        let playlist =
            std::fs::read_to_string(committed.join(HLS_PLAYLIST_FILENAME)).unwrap();
        assert!(playlist.contains("#EXT-X-TARGETDURATION:10"));
        assert!(playlist.contains("#EXT-X-KEY:METHOD=AES-128,URI=\"key_request\""));
        assert!(playlist.contains("data_seg_0003"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));

        let master =
            std::fs::read_to_string(committed.join(HLS_MASTER_PLAYLIST_FILENAME)).unwrap();
        assert!(master.contains("RESOLUTION=1280x720"));
    }

    #[test]
    fn media_playlist_parser_reads_tags() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:9\n#EXTINF:9.0,\na\n#EXTINF:9.0,\nb\n";
        assert_eq!(parse_media_playlist(text), (9, 2));
    }

    #[tokio::test]
    async fn stream_composes_master_and_serves_key() {
        let local = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let mut dst = destination(local.path(), dest.path(), "v1", false);
        run_to_completion(&mut dst, &[0x17u8; 48]).await;

        // key store next to the resource, as rotation would have left it
        let key_root = tempfile::tempdir().unwrap();
        let manager = Arc::new(KeyManager::new(key_root.path()));
        let keyfile = key_root
            .path()
            .join(resource().dir_name())
            .join("crypto_key.json");
        std::fs::create_dir_all(keyfile.parent().unwrap()).unwrap();
        let mut store = KeyStore::default();
        store.insert("908e3873".to_string(), key_entry());
        std::fs::write(&keyfile, serde_json::to_vec(&store).unwrap()).unwrap();

        let metadata = CacheMetadata {
            mimetype: "hls".to_string(),
            key_id: "908e3873".to_string(),
            usr_id: resource().usr_id,
            upld_req: resource().upld_req_id,
        };
        let dest_backend: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dest.path()));

        let mut stream = HlsStream::new(
            dest_backend.clone(),
            manager.clone(),
            metadata.clone(),
            HLS_MASTER_PLAYLIST_FILENAME,
            32,
        )
        .unwrap();
        let detail = stream.init().await.unwrap();
        assert_eq!(detail, HLS_MASTER_PLAYLIST_FILENAME);
        let mut body = Vec::new();
        loop {
            let block = stream.next_block().await.unwrap();
            body.extend_from_slice(&block.data);
            if block.is_final {
                break;
            }
        }
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("v1/lvl2_plist.m3u8"));
        assert_eq!(stream.num_playlists_merged(), 1);

        let mut key_stream = HlsStream::new(
            dest_backend.clone(),
            manager.clone(),
            metadata.clone(),
            HLS_KEY_REQUEST_LABEL,
            32,
        )
        .unwrap();
        key_stream.init().await.unwrap();
        let block = key_stream.next_block().await.unwrap();
        assert!(block.is_final);
        assert_eq!(block.data, hex::decode(key_entry().key.data).unwrap());

        // a committed segment streams as stored
        let mut seg_stream = HlsStream::new(
            dest_backend,
            manager,
            metadata,
            "v1/data_seg_0001",
            16,
        )
        .unwrap();
        seg_stream.init().await.unwrap();
        let mut seg = Vec::new();
        loop {
            let block = seg_stream.next_block().await.unwrap();
            seg.extend_from_slice(&block.data);
            if block.is_final {
                break;
            }
        }
        let stored = std::fs::read(
            dest.path()
                .join(resource().dir_name())
                .join("committed/v1/data_seg_0001"),
        )
        .unwrap();
        assert_eq!(seg, stored);
    }

    #[tokio::test]
    async fn unknown_stream_element_is_rejected() {
        let dest = tempfile::tempdir().unwrap();
        let key_root = tempfile::tempdir().unwrap();
        let dest_backend: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dest.path()));
        let manager = Arc::new(KeyManager::new(key_root.path()));
        let metadata = CacheMetadata {
            mimetype: "hls".to_string(),
            key_id: "908e3873".to_string(),
            usr_id: 126,
            upld_req: 0xd101,
        };
        let mut stream =
            HlsStream::new(dest_backend, manager, metadata, "no_such_label", 32).unwrap();
        assert!(stream.init().await.is_err());
    }
}
