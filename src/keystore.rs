//! Crypto key lifecycle for encrypted delivery.
//!
//! Each resource carries a `crypto_key.json` map of symmetric keys next to
//! its transcoded versions. Keys rotate once the file is older than the
//! configured interval; old keys stay around because previously published
//! versions still reference them. Document ids handed to clients are the
//! Base64 of the resource plaintext encrypted under the selected key
//! (AES-CBC; RFC 8216 admits no other cipher for HLS).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::rpc::ResourceKey;

pub const CRYPTO_KEY_FILENAME: &str = "crypto_key.json";
pub const CACHE_METADATA_FILENAME: &str = "metadata.json";

/// Sentinel key id selecting the entry with the greatest timestamp
pub const MOST_RECENT_KEY_ID: &str = "recent";

pub const KEY_NBYTES: usize = 16;
pub const IV_NBYTES: usize = 16; // AES-CBC: must equal the block size
pub const KEY_ID_HEX_LEN: usize = 8;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key rotation failure: {0}")]
    Rotation(String),
    #[error("cipher error: {0}")]
    Cipher(String),
    #[error("malformed key entry: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hex-encoded key material with its expected byte width
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub nbytes: usize,
    pub data: String,
}

impl KeyMaterial {
    fn decode(&self) -> Result<Vec<u8>, KeystoreError> {
        let bytes = hex::decode(&self.data)
            .map_err(|e| KeystoreError::Malformed(format!("bad hex key material: {e}")))?;
        if bytes.len() != self.nbytes {
            return Err(KeystoreError::Malformed(format!(
                "key material is {} bytes, expected {}",
                bytes.len(),
                self.nbytes
            )));
        }
        Ok(bytes)
    }
}

/// One rotation's worth of key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: KeyMaterial,
    pub iv: KeyMaterial,
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Parsed `crypto_key.json`: key id → entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyStore {
    entries: HashMap<String, KeyEntry>,
}

impl KeyStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, key_id: String, entry: KeyEntry) {
        self.entries.insert(key_id, entry);
    }

    /// Select a key: the sentinel id `"recent"` picks the entry with the
    /// greatest timestamp; anything else is a direct lookup.
    ///
    /// If any entry lacks a timestamp, the recent-scan returns `None`
    /// without a partial answer. The key file is written by this module
    /// only, so a missing timestamp means corrupted state.
    pub fn get_key(&self, key_id: &str) -> Option<(&str, &KeyEntry)> {
        if key_id != MOST_RECENT_KEY_ID {
            return self
                .entries
                .get_key_value(key_id)
                .map(|(id, e)| (id.as_str(), e));
        }
        let mut best: Option<(&str, &KeyEntry, i64)> = None;
        for (id, entry) in &self.entries {
            let ts = entry.timestamp?;
            if best.map_or(true, |(_, _, best_ts)| ts > best_ts) {
                best = Some((id.as_str(), entry, ts));
            }
        }
        best.map(|(id, entry, _)| (id, entry))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A new key was appended; carries its id
    Rotated(String),
    /// The key file is still fresh
    NotDue,
    /// Another thread holds the rotation critical section
    Busy,
}

/// Per-resource key file management with a single-rotator guard.
///
/// Share one manager per process (behind `Arc`); the `rotating` flag is the
/// only cross-thread state and only the thread that flips it false→true
/// enters the critical section.
pub struct KeyManager {
    base_dir: PathBuf,
    rotating: AtomicBool,
}

impl KeyManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        KeyManager {
            base_dir: base_dir.into(),
            rotating: AtomicBool::new(false),
        }
    }

    pub fn keyfile_path(&self, key: &ResourceKey) -> PathBuf {
        self.base_dir.join(key.dir_name()).join(CRYPTO_KEY_FILENAME)
    }

    /// Load the key store for a resource; a missing file is an empty store
    pub async fn load(&self, key: &ResourceKey) -> Result<KeyStore, KeystoreError> {
        let path = self.keyfile_path(key);
        match fs::read(&path).await {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyStore::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, key: &ResourceKey, keystore: &KeyStore) -> Result<(), KeystoreError> {
        let path = self.keyfile_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(keystore)?;
        fs::write(&path, body).await?;
        Ok(())
    }

    /// Rotate when the key file is older than `interval_secs` (or absent).
    ///
    /// Only one thread rotates at a time; contenders observe `Busy` and use
    /// whatever key is current. Derivation failures leave the store
    /// untouched and the next expiry retries.
    pub async fn rotate_if_due(
        &self,
        key: &ResourceKey,
        interval_secs: u64,
    ) -> Result<RotationOutcome, KeystoreError> {
        let path = self.keyfile_path(key);
        match fs::metadata(&path).await {
            Ok(meta) => {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok());
                if let Some(age) = age {
                    if age.as_secs() < interval_secs {
                        return Ok(RotationOutcome::NotDue);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if self
            .rotating
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Ok(RotationOutcome::Busy);
        }
        let result = self.rotate_locked(key).await;
        self.rotating.store(false, Ordering::Release);
        result
    }

    async fn rotate_locked(&self, key: &ResourceKey) -> Result<RotationOutcome, KeystoreError> {
        let (key_id, entry) = match derive_key_entry() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "key rotation aborted, previous key stays active");
                return Err(e);
            }
        };
        let mut store = self.load(key).await?;
        store.insert(key_id.clone(), entry);
        self.store(key, &store).await?;
        info!(key_id, resource = key.dir_name(), "crypto key rotated");
        Ok(RotationOutcome::Rotated(key_id))
    }
}

/// Draw fresh key material. Hex lengths are verified against the fixed
/// widths before anything is committed; a mismatch aborts the rotation.
fn derive_key_entry() -> Result<(String, KeyEntry), KeystoreError> {
    let mut key = [0u8; KEY_NBYTES];
    let mut iv = [0u8; IV_NBYTES];
    let mut key_id = [0u8; KEY_ID_HEX_LEN / 2];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);
    OsRng.fill_bytes(&mut key_id);

    let key_hex = hex::encode(key);
    let iv_hex = hex::encode(iv);
    let key_id_hex = hex::encode(key_id);
    if key_hex.len() != KEY_NBYTES * 2
        || iv_hex.len() != IV_NBYTES * 2
        || key_id_hex.len() != KEY_ID_HEX_LEN
    {
        return Err(KeystoreError::Rotation(
            "derived key material has unexpected length".to_string(),
        ));
    }
    let entry = KeyEntry {
        key: KeyMaterial {
            nbytes: KEY_NBYTES,
            data: key_hex,
        },
        iv: KeyMaterial {
            nbytes: IV_NBYTES,
            data: iv_hex,
        },
        alg: "aes".to_string(),
        timestamp: Some(Utc::now().timestamp()),
    };
    Ok((key_id_hex, entry))
}

/// AES-CBC/PKCS#7 encrypt an arbitrary payload under a key entry
pub fn encrypt_payload(entry: &KeyEntry, plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let key = entry.key.decode()?;
    let iv = entry.iv.decode()?;
    let invalid = |e: aes::cipher::InvalidLength| KeystoreError::Cipher(e.to_string());
    let ciphertext = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => Aes192CbcEnc::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        n => {
            return Err(KeystoreError::Cipher(format!(
                "unsupported key width: {n} bytes"
            )))
        }
    };
    Ok(ciphertext)
}

/// Inverse of [`encrypt_payload`]
pub fn decrypt_payload(entry: &KeyEntry, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let key = entry.key.decode()?;
    let iv = entry.iv.decode()?;
    let invalid = |e: aes::cipher::InvalidLength| KeystoreError::Cipher(e.to_string());
    let unpad = |e: aes::cipher::block_padding::UnpadError| KeystoreError::Cipher(e.to_string());
    let plaintext = match key.len() {
        16 => Aes128CbcDec::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad)?,
        24 => Aes192CbcDec::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad)?,
        32 => Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad)?,
        n => {
            return Err(KeystoreError::Cipher(format!(
                "unsupported key width: {n} bytes"
            )))
        }
    };
    Ok(plaintext)
}

/// Encrypt `"<usr_id>/<08x upld_req_id>"` into the opaque document id
/// clients use to address a cache entry. The Base64 alphabet includes `/`;
/// the resulting path component may therefore nest, by design.
pub fn encrypt_document_id(
    key: &ResourceKey,
    entry: &KeyEntry,
) -> Result<String, KeystoreError> {
    let ciphertext = encrypt_payload(entry, key.doc_plaintext().as_bytes())?;
    Ok(BASE64.encode(ciphertext))
}

/// Decode a document id back to the resource key it names
pub fn decrypt_document_id(doc_id: &str, entry: &KeyEntry) -> Result<ResourceKey, KeystoreError> {
    let ciphertext = BASE64
        .decode(doc_id)
        .map_err(|e| KeystoreError::Malformed(format!("bad document id: {e}")))?;
    let plaintext = decrypt_payload(entry, &ciphertext)?;
    let text = String::from_utf8(plaintext)
        .map_err(|e| KeystoreError::Malformed(format!("bad document id plaintext: {e}")))?;
    let (usr, req) = text
        .split_once('/')
        .ok_or_else(|| KeystoreError::Malformed("document id has no separator".to_string()))?;
    let usr_id: u32 = usr
        .parse()
        .map_err(|_| KeystoreError::Malformed("bad user id in document id".to_string()))?;
    let upld_req_id = u32::from_str_radix(req, 16)
        .map_err(|_| KeystoreError::Malformed("bad request id in document id".to_string()))?;
    ResourceKey::new(usr_id, upld_req_id)
        .map_err(|_| KeystoreError::Malformed("zero id in document id".to_string()))
}

/// Sidecar persisted next to a cache entry so the delivery layer can
/// resolve mimetype, key and owner without touching the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub mimetype: String,
    pub key_id: String,
    pub usr_id: u32,
    pub upld_req: u32,
}

/// Write the cache sidecar once; subsequent calls are skipped.
/// Returns `true` when an existing sidecar was left in place.
pub async fn save_cache_metadata(
    dir: &Path,
    metadata: &CacheMetadata,
) -> Result<bool, KeystoreError> {
    let path = dir.join(CACHE_METADATA_FILENAME);
    match fs::metadata(&path).await {
        Ok(_) => {
            debug!(path = %path.display(), "cache metadata already present, skipped");
            return Ok(true);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec(metadata)?;
    fs::write(&path, body).await?;
    Ok(false)
}

pub async fn load_cache_metadata(dir: &Path) -> Result<CacheMetadata, KeystoreError> {
    let path = dir.join(CACHE_METADATA_FILENAME);
    let body = fs::read(&path).await?;
    Ok(serde_json::from_slice(&body)?)
}
