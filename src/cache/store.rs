//! Backing stores for cache entries.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::{CacheEntry, CacheError, CacheKey};
use crate::clock::Clock;

/// Key/value store for cache entries with per-write expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Entry for `key`, or `None` if absent or expired.
    async fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    /// Replace the entry for `key`; it expires `ttl` after the write.
    async fn write(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError>;
    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Process-local store.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<CacheKey, Stored>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Stored>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now_ms();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at_ms > now => Ok(Some(stored.entry.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let stored = Stored {
            expires_at_ms: self.clock.now_ms().saturating_add(ttl.as_millis() as u64),
            entry: entry.clone(),
        };
        self.lock().insert(key.clone(), stored);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// On-disk record wrapping an entry with its expiry.
#[derive(Serialize, Deserialize)]
struct Stored {
    expires_at_ms: u64,
    entry: CacheEntry,
}

/// JSON files under `root`, one per key, named by the SHA-1 of the key.
/// Writes go through a temp file and an atomic rename.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileStore {
    pub fn new(root: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self { root, clock }
    }

    /// Ensure the cache directory exists.
    pub fn init(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Delete expired or unreadable entry files. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let now = self.clock.now_ms();
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(&self.root).max_depth(1) {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let live = fs::read_to_string(path)
                .ok()
                .and_then(|data| serde_json::from_str::<Stored>(&data).ok())
                .is_some_and(|stored| stored.expires_at_ms > now);
            if !live {
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        debug!(root = %self.root.display(), removed, "purged cache files");
        Ok(removed)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(key.view.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.subject.as_bytes());
        self.root.join(format!("{}.json", hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn read(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let now = self.clock.now_ms();
        blocking(move || {
            let data = match fs::read_to_string(&path) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let stored: Stored = serde_json::from_str(&data)?;
            if stored.expires_at_ms <= now {
                return Ok(None);
            }
            Ok(Some(stored.entry))
        })
        .await
    }

    async fn write(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        let root = self.root.clone();
        let path = self.entry_path(key);
        let stored = Stored {
            expires_at_ms: self.clock.now_ms().saturating_add(ttl.as_millis() as u64),
            entry: entry.clone(),
        };
        blocking(move || {
            fs::create_dir_all(&root)?;
            let tmp = tempfile::NamedTempFile::new_in(&root)?;
            serde_json::to_writer(&tmp, &stored)?;
            tmp.persist(path)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        blocking(move || match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

/// Run file IO on the blocking pool.
async fn blocking<T, F>(op: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| CacheError::Unavailable(format!("io task: {e}")))?
}
