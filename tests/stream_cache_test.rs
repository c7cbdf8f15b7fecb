// Cache layer scenarios against a published HLS resource: lazy population
// through the resident processor, cache hits, lock contention and the
// missing-metadata path.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;

use medley::cache::{doc_dir, CacheEntry, CacheError, PopulateSource, RegistryProcessorFactory};
use medley::config::{EngineConfig, SegmentNaming};
use medley::job::JobRunner;
use medley::keystore::{
    self, encrypt_document_id, CacheMetadata, KeyManager, MOST_RECENT_KEY_ID,
};
use medley::processor::{PassthroughCodec, HLS_MASTER_PLAYLIST_FILENAME};
use medley::rpc::{JobEvent, ResourceKey, TranscodeRequest};
use medley::storage::{LocalStorage, StorageBackend, StorageRegistry};

const USR_ID: u32 = 126;
const UPLD_REQ: u32 = 0xd101beef;

struct Fixture {
    _storage_dir: tempfile::TempDir,
    _cache_dir: tempfile::TempDir,
    storage_root: PathBuf,
    cache_root: PathBuf,
    keys: Arc<KeyManager>,
    dest: Arc<dyn StorageBackend>,
}

fn resource() -> ResourceKey {
    ResourceKey::new(USR_ID, UPLD_REQ).unwrap()
}

async fn publish_resource() -> Fixture {
    let storage_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let storage_root = storage_dir.path().to_path_buf();
    let cache_root = cache_dir.path().to_path_buf();

    // seed an upload that sniffs as mp4
    let dir = storage_root.join(resource().dir_name());
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let mut payload = vec![0u8, 0, 0, 0x18];
    payload.extend_from_slice(b"ftypisom");
    while payload.len() < 600 {
        payload.push((payload.len() % 249) as u8);
    }
    tokio::fs::write(dir.join("1"), &payload).await.unwrap();

    let config = EngineConfig {
        tmp_dir: cache_root.join("staging"),
        cache_dir: cache_root.clone(),
        transfer_buffer_bytes: 64,
        cache_buffer_bytes: 32,
        keyfile_update_interval_secs: 3600,
        version_label_len: 2,
        segment_naming: SegmentNaming::default(),
        hls_segment_duration_secs: 10.0,
    };
    let mut storages = StorageRegistry::new();
    storages.register("localfs", Arc::new(LocalStorage::new(&storage_root)));
    let keys = Arc::new(KeyManager::new(&storage_root));
    let runner = Arc::new(JobRunner::new(
        config,
        storages,
        Arc::new(PassthroughCodec::new(128)),
        keys.clone(),
    ));

    let request: TranscodeRequest = serde_json::from_value(serde_json::json!({
        "usr_id": USR_ID,
        "last_upld_req": UPLD_REQ,
        "storage_alias": "localfs",
        "outputs": {
            "v1": {
                "container": "hls",
                "elementary_streams": ["vid"],
                "storage_alias": "localfs",
                "__internal__": {"video_key": "vid"}
            }
        },
        "elementary_streams": {
            "vid": {
                "type": "video",
                "codec": "libx264",
                "attribute": {"height_pixel": 720, "width_pixel": 1280, "framerate": 24}
            }
        },
        "parts_size": [600]
    }))
    .unwrap();

    let mut rx = runner.submit(request, vec![]);
    let mut completed = false;
    while let Some(event) = rx.recv().await {
        if let JobEvent::Failed { error } = &event {
            panic!("publish failed: {:?}", error.to_json());
        }
        if matches!(event, JobEvent::Completed { .. }) {
            completed = true;
        }
    }
    assert!(completed);

    let dest: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&storage_root));
    Fixture {
        _storage_dir: storage_dir,
        _cache_dir: cache_dir,
        storage_root,
        cache_root,
        keys,
        dest,
    }
}

/// Encrypted doc id + sidecar, as the stream-lookup surface prepares them
async fn prepare_doc(fixture: &Fixture) -> String {
    let store = fixture.keys.load(&resource()).await.unwrap();
    let (key_id, entry) = store.get_key(MOST_RECENT_KEY_ID).unwrap();
    let doc_id = encrypt_document_id(&resource(), entry).unwrap();
    let dir = doc_dir(&fixture.cache_root, &doc_id);
    keystore::save_cache_metadata(
        &dir,
        &CacheMetadata {
            mimetype: "hls".to_string(),
            key_id: key_id.to_string(),
            usr_id: USR_ID,
            upld_req: UPLD_REQ,
        },
    )
    .await
    .unwrap();
    doc_id
}

fn stream_factory(fixture: &Fixture) -> PopulateSource {
    PopulateSource::Processor(Arc::new(RegistryProcessorFactory {
        dest: fixture.dest.clone(),
        keys: fixture.keys.clone(),
        block_bytes: 32,
    }))
}

#[tokio::test]
async fn master_playlist_populates_and_then_hits() {
    let fixture = publish_resource().await;
    let doc_id = prepare_doc(&fixture).await;

    let entry = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        HLS_MASTER_PLAYLIST_FILENAME,
        32,
        stream_factory(&fixture),
    )
    .await
    .unwrap();
    assert!(!entry.already_cached());

    let blocks: Vec<Vec<u8>> = entry
        .into_stream()
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await;
    let body = String::from_utf8(blocks.concat()).unwrap();
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("v1/lvl2_plist.m3u8"));

    // populated file is on disk and the next request is a plain hit
    let cached_path = doc_dir(&fixture.cache_root, &doc_id).join(HLS_MASTER_PLAYLIST_FILENAME);
    assert_eq!(
        tokio::fs::read_to_string(&cached_path).await.unwrap(),
        body
    );
    let entry = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        HLS_MASTER_PLAYLIST_FILENAME,
        1024,
        stream_factory(&fixture),
    )
    .await
    .unwrap();
    assert!(entry.already_cached());
}

#[tokio::test]
async fn committed_segment_streams_through_cache() {
    let fixture = publish_resource().await;
    let doc_id = prepare_doc(&fixture).await;

    let entry = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        "v1/data_seg_0001",
        16,
        stream_factory(&fixture),
    )
    .await
    .unwrap();
    let blocks: Vec<Vec<u8>> = entry
        .into_stream()
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await;
    let served = blocks.concat();

    let stored = tokio::fs::read(
        fixture
            .storage_root
            .join(resource().dir_name())
            .join("committed/v1/data_seg_0001"),
    )
    .await
    .unwrap();
    assert_eq!(served, stored);
}

#[tokio::test]
async fn nested_detail_cache_hit_reads_on_disk_bytes() {
    let fixture = publish_resource().await;
    let doc_id = prepare_doc(&fixture).await;
    let dir = doc_dir(&fixture.cache_root, &doc_id);
    tokio::fs::create_dir_all(dir.join("abc/def")).await.unwrap();
    tokio::fs::write(dir.join("abc/def/ghij.txt"), b"nested cached body")
        .await
        .unwrap();

    let mut entry = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        "abc/def/ghij.txt",
        1024,
        stream_factory(&fixture),
    )
    .await
    .unwrap();
    assert!(entry.already_cached());
    let block = entry.proceed().await.unwrap();
    assert!(block.is_final);
    assert_eq!(block.data, b"nested cached body");
    entry.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_population_is_refused_then_allowed() {
    let fixture = publish_resource().await;
    let doc_id = prepare_doc(&fixture).await;

    let mut first = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        HLS_MASTER_PLAYLIST_FILENAME,
        32,
        stream_factory(&fixture),
    )
    .await
    .unwrap();

    let second = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        HLS_MASTER_PLAYLIST_FILENAME,
        32,
        stream_factory(&fixture),
    )
    .await;
    assert!(matches!(second, Err(CacheError::Busy)));

    // first finishes population, third sees the ready cache
    loop {
        let block = first.proceed().await.unwrap();
        if block.is_final {
            break;
        }
    }
    first.close().await.unwrap();

    let third = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        HLS_MASTER_PLAYLIST_FILENAME,
        32,
        stream_factory(&fixture),
    )
    .await
    .unwrap();
    assert!(third.already_cached());
}

#[tokio::test]
async fn empty_metadata_sidecar_yields_404() {
    let fixture = publish_resource().await;
    let dir = doc_dir(&fixture.cache_root, "bogus-doc");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("metadata.json"), b"").await.unwrap();

    let err = CacheEntry::open(
        &fixture.cache_root,
        "bogus-doc",
        HLS_MASTER_PLAYLIST_FILENAME,
        32,
        stream_factory(&fixture),
    )
    .await
    .err()
    .expect("must refuse");
    assert!(matches!(err, CacheError::MissingMetadata));

    // entry dir holds only the corrupt sidecar, nothing was created
    let mut reader = tokio::fs::read_dir(&dir).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["metadata.json".to_string()]);
}

#[tokio::test]
async fn key_request_serves_key_octets() {
    let fixture = publish_resource().await;
    let doc_id = prepare_doc(&fixture).await;

    let entry = CacheEntry::open(
        &fixture.cache_root,
        &doc_id,
        "key_request",
        64,
        stream_factory(&fixture),
    )
    .await
    .unwrap();
    let blocks: Vec<Vec<u8>> = entry
        .into_stream()
        .map(|r| r.unwrap())
        .collect::<Vec<_>>()
        .await;
    let key_bytes = blocks.concat();
    assert_eq!(key_bytes.len(), 16);

    let store = fixture.keys.load(&resource()).await.unwrap();
    let (_, key_entry) = store.get_key(MOST_RECENT_KEY_ID).unwrap();
    assert_eq!(key_bytes, hex::decode(&key_entry.key.data).unwrap());
}
