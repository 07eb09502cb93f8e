//! Per-video content keys.
//!
//! Keys are derived, not generated: `salt = SHA256(salt_prefix ++ video_id)`
//! and `key = PBKDF2-HMAC-SHA256(master_seed, salt, rounds, 16)`. The same
//! id always yields the same key, so a lost `key.bin` can be recreated. The
//! file exists because the packager and the serving layer want raw bytes,
//! not a derivation call.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use hmac::Hmac;
use sha2::{Digest, Sha256};
use vs_av::workspace::write_atomic;
use vs_av::WorkspaceManager;
use vs_core::config::KeyConfig;
use vs_core::{Error, Result, VideoId};

/// Content key length in bytes (AES-128).
pub const KEY_LEN: usize = 16;

pub type ContentKey = [u8; KEY_LEN];

/// Derive the key for `video_id`. CPU bound; prefer
/// [`KeyManager::derive_key`] from async code.
pub fn derive_key(
    master_seed: &str,
    salt_prefix: &str,
    video_id: &str,
    rounds: u32,
) -> Result<ContentKey> {
    if master_seed.is_empty() {
        return Err(Error::EncryptionSetup("master seed is empty".into()));
    }
    if rounds == 0 {
        return Err(Error::EncryptionSetup("PBKDF2 rounds must be positive".into()));
    }

    let mut hasher = Sha256::new();
    hasher.update(salt_prefix.as_bytes());
    hasher.update(video_id.as_bytes());
    let salt = hasher.finalize();

    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(master_seed.as_bytes(), &salt, rounds, &mut key)
        .map_err(|e| Error::EncryptionSetup(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// A fresh random key id. Only the key is deterministic.
pub fn generate_key_id() -> ContentKey {
    use rand::Rng;
    rand::thread_rng().gen()
}

/// XOR `data` with the key stream starting at byte `offset`.
pub fn xor_transform(data: &[u8], key: &ContentKey, offset: u64) -> Vec<u8> {
    let mut out = data.to_vec();
    xor_in_place(&mut out, key, offset);
    out
}

/// In-place form of [`xor_transform`].
pub fn xor_in_place(data: &mut [u8], key: &ContentKey, offset: u64) {
    let start = (offset % KEY_LEN as u64) as usize;
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(start + i) % KEY_LEN];
    }
}

/// Applies [`xor_in_place`] across consecutive chunks of one stream.
#[derive(Clone)]
pub struct XorStream {
    key: ContentKey,
    offset: u64,
}

impl XorStream {
    pub fn new(key: ContentKey) -> Self {
        Self { key, offset: 0 }
    }

    pub fn apply(&mut self, chunk: &mut [u8]) {
        xor_in_place(chunk, &self.key, self.offset);
        self.offset += chunk.len() as u64;
    }

    /// Bytes processed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Result of [`KeyManager::generate_and_store_key`].
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: ContentKey,
    pub key_path: PathBuf,
    /// The legacy `keyinfo.txt`, when enabled.
    pub key_info_file: Option<PathBuf>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("key_path", &self.key_path)
            .field("key_info_file", &self.key_info_file)
            .finish()
    }
}

/// Derives, stores and reads per-video keys inside the video workspaces.
pub struct KeyManager {
    workspaces: Arc<WorkspaceManager>,
    config: KeyConfig,
}

impl KeyManager {
    pub fn new(workspaces: Arc<WorkspaceManager>, config: KeyConfig) -> Self {
        Self { workspaces, config }
    }

    /// Derive the key for `video_id` on the blocking pool.
    pub async fn derive_key(&self, video_id: &VideoId) -> Result<ContentKey> {
        let seed = self.config.master_seed.clone();
        let prefix = self.config.salt_prefix.clone();
        let rounds = self.config.rounds;
        let id = video_id.to_string();
        tokio::task::spawn_blocking(move || derive_key(&seed, &prefix, &id, rounds))
            .await
            .map_err(|e| Error::Internal(format!("key derivation task failed: {e}")))?
    }

    /// Derive the key and write `key.bin` (plus `keyinfo.txt` when the
    /// legacy companion file is enabled). Safe to repeat.
    pub async fn generate_and_store_key(&self, video_id: &VideoId) -> Result<KeyMaterial> {
        let key = self.derive_key(video_id).await?;
        let ws = self.workspaces.layout(video_id);

        write_atomic(&ws.key_path, &key, Some(0o600)).await?;

        let key_info_file = if self.config.legacy_keyinfo {
            let url = format!(
                "{}/{}/key",
                self.config.key_url_base.trim_end_matches('/'),
                video_id
            );
            let body = format!("{url}\n{}\n", ws.key_path.display());
            write_atomic(&ws.keyinfo_path, body.as_bytes(), Some(0o600)).await?;
            Some(ws.keyinfo_path.clone())
        } else {
            None
        };

        tracing::debug!(video_id = %video_id, path = %ws.key_path.display(), "Stored content key");
        Ok(KeyMaterial {
            key,
            key_path: ws.key_path,
            key_info_file,
        })
    }

    /// Read the stored key for `video_id`.
    pub async fn retrieve_key(&self, video_id: &VideoId) -> Result<ContentKey> {
        let path = self.workspaces.layout(video_id).key_path;
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("key", video_id),
            _ => e.into(),
        })?;
        ContentKey::try_from(bytes.as_slice()).map_err(|_| {
            Error::EncryptionSetup(format!(
                "stored key for {video_id} is {} bytes, expected {KEY_LEN}",
                bytes.len()
            ))
        })
    }

    pub async fn key_exists(&self, video_id: &VideoId) -> bool {
        tokio::fs::metadata(self.workspaces.layout(video_id).key_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Remove `keyinfo.txt`. The key itself stays. Returns whether a file
    /// was removed.
    pub async fn cleanup_temp_files(&self, video_id: &VideoId) -> Result<bool> {
        let path = self.workspaces.layout(video_id).keyinfo_path;
        self.workspaces.remove_file(&path).await
    }
}
