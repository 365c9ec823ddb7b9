//! Durable tier: one pretty-printed JSON file per key.
//!
//! Writes are fire-and-forget and run on the cache's [`TaskPool`]. Each scheduled
//! write carries a sequence number, and a write only lands if it is still the
//! latest one recorded for its key. Removal forgets the key's sequence before
//! deleting the file, under the same I/O lock the writers take, so a write
//! scheduled before an invalidation can never recreate the file afterwards.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::keys::belongs_to;
use crate::background::TaskPool;
use crate::error::{Error, Result};

/// Longest sanitized key prefix kept in a file name.
const MAX_STEM_LEN: usize = 64;
/// Hex characters of the key digest appended to every file name.
const HASH_LEN: usize = 16;
const EXTENSION: &str = "json";

/// File-backed cache tier rooted at one directory.
///
/// File names are the key with unsafe characters replaced, cut to 64
/// characters, then a dash and 16 hex characters of the key's SHA-256.
#[derive(Debug)]
pub struct DurableStore {
    dir: PathBuf,
    pool: TaskPool,
    seq: AtomicU64,
    latest: DashMap<String, u64>,
    io_lock: Mutex<()>,
    pending: AtomicUsize,
    idle: Notify,
}

#[derive(Deserialize)]
struct KeyOnly {
    key: String,
}

impl DurableStore {
    /// Opens (creating if needed) the store directory.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, pool: TaskPool) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "durable cache opened");
        Ok(Self {
            dir,
            pool,
            seq: AtomicU64::new(0),
            latest: DashMap::new(),
            io_lock: Mutex::new(()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// The directory holding one JSON file per key.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file that holds `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    /// Schedules `entry` to be written. Returns immediately.
    pub fn write<T: Serialize>(self: &Arc<Self>, entry: &CacheEntry<T>) {
        let bytes = match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %entry.key, error = %err, "cache entry not serializable, skipping disk");
                return;
            }
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.insert(entry.key.clone(), seq);
        self.pending.fetch_add(1, Ordering::SeqCst);

        let store = Arc::clone(self);
        let key = entry.key.clone();
        self.pool.spawn(async move {
            store.write_if_latest(&key, seq, &bytes).await;
            if store.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                store.idle.notify_waiters();
            }
        });
    }

    async fn write_if_latest(&self, key: &str, seq: u64, bytes: &[u8]) {
        let _io = self.io_lock.lock().await;
        if self.latest.get(key).map(|latest| *latest) != Some(seq) {
            debug!(key, seq, "superseded cache write dropped");
            return;
        }
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let written = async {
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        match written {
            Ok(()) => {
                self.latest.remove_if(key, |_, latest| *latest == seq);
            }
            Err(err) => warn!(key, error = %err, "cache write failed"),
        }
    }

    /// Waits until every scheduled write has finished.
    pub async fn flush(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Reads the entry for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::CacheCorruption`] when the file does not parse or belongs to a
    /// different key; [`Error::Io`] for other read failures.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: CacheEntry<T> =
            serde_json::from_slice(&bytes).map_err(|err| Error::CacheCorruption {
                key: key.to_string(),
                reason: err.to_string(),
            })?;
        if entry.key != key {
            return Err(Error::CacheCorruption {
                key: key.to_string(),
                reason: format!("file holds key {}", entry.key),
            });
        }
        Ok(Some(entry))
    }

    /// Deletes the file for `key` and cancels any pending write of it.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.latest.remove(key);
        let _io = self.io_lock.lock().await;
        remove_if_exists(&self.path_for(key)).await
    }

    /// Deletes every file whose key belongs to `resource`.
    pub async fn remove_prefix(&self, resource: &str) -> Result<usize> {
        self.latest.retain(|key, _| !belongs_to(key, resource));
        let _io = self.io_lock.lock().await;
        let mut removed = 0;
        for path in self.entry_files().await? {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(KeyOnly { key }) = serde_json::from_slice(&bytes) else {
                continue;
            };
            if belongs_to(&key, resource) {
                remove_if_exists(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every entry file and cancels all pending writes.
    pub async fn clear(&self) -> Result<usize> {
        self.latest.clear();
        let _io = self.io_lock.lock().await;
        let mut removed = 0;
        for path in self.entry_files().await? {
            remove_if_exists(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// `<sanitized key, at most 64 chars>-<16 hex chars of sha256(key)>.json`
pub fn file_name(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{stem}-{}.{EXTENSION}", &digest[..HASH_LEN])
}
