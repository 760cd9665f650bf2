use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflows::review::domain::WorkspaceSnapshot;

/// Format marker stored with every entry; entries with any other value are discarded.
pub const CACHE_VERSION: &str = "v1";

/// Cache entries are scoped to one form inside one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub form_id: String,
    pub workspace_id: String,
}

impl CacheKey {
    pub fn new(form_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            form_id: form_id.into(),
            workspace_id: workspace_id.into(),
        }
    }

    /// Hex keeps distinct ids on distinct files whatever characters they contain.
    fn file_name(&self) -> String {
        format!(
            "review_{}_{}.json",
            hex::encode(&self.form_id),
            hex::encode(&self.workspace_id)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub version: String,
    pub stored_at: DateTime<Utc>,
    pub snapshot: WorkspaceSnapshot,
}

impl CachedSnapshot {
    pub fn new(snapshot: WorkspaceSnapshot, stored_at: DateTime<Utc>) -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            stored_at,
            snapshot,
        }
    }

    /// Current format and younger than `ttl` at `now`. Entries stamped in the future are stale.
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.version != CACHE_VERSION {
            return false;
        }
        let age = now.signed_duration_since(self.stored_at);
        if age < chrono::Duration::zero() {
            return false;
        }
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age <= ttl,
            Err(_) => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Advisory persisted copy of the last good workspace state.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Option<CachedSnapshot>, CacheError>;
    async fn store(&self, key: &CacheKey, entry: &CachedSnapshot) -> Result<(), CacheError>;
    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotCache {
    entries: Mutex<HashMap<CacheKey, CachedSnapshot>>,
}

impl MemorySnapshotCache {
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotCache for MemorySnapshotCache {
    async fn load(&self, key: &CacheKey) -> Result<Option<CachedSnapshot>, CacheError> {
        Ok(self
            .entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned()))
    }

    async fn store(&self, key: &CacheKey, entry: &CachedSnapshot) -> Result<(), CacheError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.clone(), entry.clone());
        }
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
        Ok(())
    }
}

/// On-disk document; the key travels with the entry so a load can reject a foreign file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry<E> {
    key: CacheKey,
    entry: E,
}

/// One JSON document per key under a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotCache {
    dir: PathBuf,
}

impl FileSnapshotCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

#[async_trait]
impl SnapshotCache for FileSnapshotCache {
    async fn load(&self, key: &CacheKey) -> Result<Option<CachedSnapshot>, CacheError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let stored: StoredEntry<CachedSnapshot> = serde_json::from_slice(&bytes)?;
        if stored.key != *key {
            tracing::debug!(
                form_id = %key.form_id,
                stored_form_id = %stored.key.form_id,
                "cache file belongs to another key"
            );
            return Ok(None);
        }
        Ok(Some(stored.entry))
    }

    async fn store(&self, key: &CacheKey, entry: &CachedSnapshot) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec(&StoredEntry {
            key: key.clone(),
            entry,
        })?;
        let path = self.path_for(key);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
