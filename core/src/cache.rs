use crate::{ChecksumSet, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Remembers checksums of stored objects so remote content does not have to
/// be downloaded again just to learn its digests.
#[async_trait]
pub trait ChecksumCache: Send + Sync {
    /// `Ok(None)` means "not cached", never an error.
    async fn get(&self, path: &str) -> Result<Option<ChecksumSet>>;

    /// Last writer wins.
    async fn update(&self, path: &str, checksums: &ChecksumSet) -> Result<()>;

    /// Persists buffered updates. A no-op for caches that are not persisted.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryChecksumCache {
    entries: RwLock<HashMap<String, ChecksumSet>>,
}

impl MemoryChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ChecksumCache for MemoryChecksumCache {
    async fn get(&self, path: &str) -> Result<Option<ChecksumSet>> {
        Ok(self.entries.read().await.get(path).cloned())
    }

    async fn update(&self, path: &str, checksums: &ChecksumSet) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(path.to_string(), checksums.clone());
        Ok(())
    }
}

/// A cache persisted as one JSON document.
///
/// Updates land in memory and are written out every `flush_every` changes
/// and on [`flush`](ChecksumCache::flush). Writes go to a sibling temp file
/// and are renamed into place so a crash never leaves a truncated cache
/// behind.
pub struct FileChecksumCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, ChecksumSet>>,
    dirty: AtomicUsize,
    flush_every: usize,
    save_lock: Mutex<()>,
}

impl FileChecksumCache {
    pub const DEFAULT_FLUSH_EVERY: usize = 256;

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "Loaded checksum cache");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            dirty: AtomicUsize::new(0),
            flush_every: Self::DEFAULT_FLUSH_EVERY,
            save_lock: Mutex::new(()),
        })
    }

    /// Number of updates buffered before the file is rewritten. `1` writes
    /// through on every update.
    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates not yet written to disk.
    pub fn pending(&self) -> usize {
        self.dirty.load(Ordering::SeqCst)
    }

    async fn save(&self) -> Result<()> {
        let _saving = self.save_lock.lock().await;
        if self.dirty.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let data = {
            let entries = self.entries.read().await;
            // taken under the read lock so no update slips between snapshot and reset
            self.dirty.store(0, Ordering::SeqCst);
            serde_json::to_vec(&*entries)?
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "Saved checksum cache");
        Ok(())
    }
}

#[async_trait]
impl ChecksumCache for FileChecksumCache {
    async fn get(&self, path: &str) -> Result<Option<ChecksumSet>> {
        Ok(self.entries.read().await.get(path).cloned())
    }

    async fn update(&self, path: &str, checksums: &ChecksumSet) -> Result<()> {
        let pending = {
            let mut entries = self.entries.write().await;
            entries.insert(path.to_string(), checksums.clone());
            self.dirty.fetch_add(1, Ordering::SeqCst) + 1
        };
        if pending >= self.flush_every {
            self.save().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_cache_absent_is_none() {
        let cache = MemoryChecksumCache::new();
        assert!(cache.get("a/b/c").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_cache_concurrent_updates() {
        let cache = Arc::new(MemoryChecksumCache::new());
        let mut handles = Vec::new();
        for i in 0..64u64 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("key{}", i % 8);
                let checksums = ChecksumSet { size: i, ..Default::default() };
                cache.update(&key, &checksums).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len().await, 8);
    }

    #[tokio::test]
    async fn test_file_cache_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("checksums.json");
        let checksums = ChecksumSet::compute_bytes(b"persist me");

        {
            let cache = FileChecksumCache::open(&path).await.unwrap();
            cache.update("c7/6b/file.deb", &checksums).await.unwrap();
            cache.flush().await.unwrap();
        }

        let reopened = FileChecksumCache::open(&path).await.unwrap();
        assert_eq!(reopened.get("c7/6b/file.deb").await.unwrap(), Some(checksums));
        assert!(reopened.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_cache_batches_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checksums.json");
        let cache = FileChecksumCache::open(&path).await.unwrap().with_flush_every(3);

        for i in 0..2u64 {
            let checksums = ChecksumSet { size: i, ..Default::default() };
            cache.update(&format!("key{}", i), &checksums).await.unwrap();
        }
        assert!(!path.exists());
        assert_eq!(cache.pending(), 2);

        let checksums = ChecksumSet { size: 2, ..Default::default() };
        cache.update("key2", &checksums).await.unwrap();
        assert!(path.exists());
        assert_eq!(cache.pending(), 0);

        cache.update("key3", &checksums).await.unwrap();
        let reopened = FileChecksumCache::open(&path).await.unwrap();
        assert!(reopened.get("key3").await.unwrap().is_none());

        cache.flush().await.unwrap();
        let reopened = FileChecksumCache::open(&path).await.unwrap();
        assert_eq!(reopened.get("key3").await.unwrap(), Some(checksums));
    }
}
