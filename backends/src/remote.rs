//! Published storage on a flat object store.
//!
//! Keys are `<prefix>/<path>`. The MD5 of every published object is kept in
//! a [`PathCache`] filled from one full listing, so linking thousands of
//! packages costs one listing plus one upload per changed file instead of a
//! HEAD per file.

use crate::locks::{KeyedGuard, KeyedLock};
use crate::object_store::{
    MD5_METADATA_KEY, Metadata, ObjectEntry, ObjectStore, SYMLINK_METADATA_KEY, is_md5_hex,
    md5_hex,
};
use crate::path_cache::PathCache;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::storage::{LinkRequest, PublishedStorage, StorageType, read_pool_object};
use async_trait::async_trait;
use bytes::Bytes;
use debpool_core::paths::join_key;
use debpool_core::{Error, ProgressSink, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Key prefix all published paths live under.
    pub prefix: String,
    pub retry: RetryConfig,
    /// Keys per bulk delete request.
    pub delete_batch_size: usize,
    /// Directory levels expanded with delimiter listings before the
    /// remaining subtrees are listed in parallel. 0 lists everything in one
    /// paginated sequence.
    pub listing_depth: usize,
    pub listing_concurrency: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            retry: RetryConfig::default(),
            delete_batch_size: 1000,
            listing_depth: 0,
            listing_concurrency: 16,
        }
    }
}

pub struct RemotePublishedStorage<S: ObjectStore> {
    store: Arc<S>,
    config: RemoteConfig,
    path_cache: PathCache,
    locks: KeyedLock,
    cancel: CancellationToken,
}

impl<S: ObjectStore> RemotePublishedStorage<S> {
    pub fn new(store: Arc<S>, config: RemoteConfig) -> Self {
        Self {
            store,
            config,
            path_cache: PathCache::new(),
            locks: KeyedLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Ties listings, copies and retry loops to `cancel`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn path_cache(&self) -> &PathCache {
        &self.path_cache
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn key(&self, path: &str) -> String {
        join_key(&[self.config.prefix.as_str(), path])
    }

    /// Listing prefix selecting everything below the directory `path`.
    fn dir_prefix(&self, path: &str) -> String {
        let key = self.key(path);
        if key.is_empty() { key } else { format!("{}/", key) }
    }

    fn relative<'k>(&self, key: &'k str) -> Option<&'k str> {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            return Some(key);
        }
        key.strip_prefix(prefix)?.strip_prefix('/')
    }

    async fn list_flat(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = retry_with_backoff(&self.config.retry, "list_objects", &self.cancel, || {
                self.store.list_page(prefix, None, marker.as_deref())
            })
            .await?;
            objects.extend(page.objects);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => return Ok(objects),
            }
        }
    }

    /// One directory level: the objects directly below `prefix` and its
    /// subdirectories.
    async fn list_level(&self, prefix: &str) -> Result<(Vec<ObjectEntry>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut dirs = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = retry_with_backoff(&self.config.retry, "list_objects", &self.cancel, || {
                self.store.list_page(prefix, Some("/"), marker.as_deref())
            })
            .await?;
            objects.extend(page.objects);
            dirs.extend(page.common_prefixes);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => return Ok((objects, dirs)),
            }
        }
    }

    /// Every object below `prefix`, sorted by key.
    async fn list_all(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let concurrency = self.config.listing_concurrency.max(1);
        let mut objects = Vec::new();
        let mut leaves = Vec::new();
        let mut frontier = vec![prefix.to_string()];

        for _ in 0..self.config.listing_depth {
            if frontier.is_empty() {
                break;
            }
            let levels: Vec<_> = stream::iter(std::mem::take(&mut frontier))
                .map(|dir| async move { self.list_level(&dir).await })
                .buffer_unordered(concurrency)
                .collect()
                .await;
            let mut next = Vec::new();
            for level in levels {
                let (found, dirs) = level?;
                objects.extend(found);
                for dir in dirs {
                    // index files change together; one listing is enough
                    if is_dists_dir(&dir) {
                        leaves.push(dir);
                    } else {
                        next.push(dir);
                    }
                }
            }
            frontier = next;
        }
        leaves.extend(frontier);

        let listed: Vec<_> = stream::iter(leaves)
            .map(|dir| async move { self.list_flat(&dir).await })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for found in listed {
            objects.extend(found?);
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn ensure_path_cache(&self) -> Result<()> {
        self.path_cache
            .get_or_populate(|| async {
                let objects = self.list_all(&self.dir_prefix("")).await?;
                let entries: HashMap<String, String> = objects
                    .into_iter()
                    .filter_map(|object| {
                        let rel = self.relative(&object.key)?.to_string();
                        // resolved lazily when a link needs it
                        let md5 = object.md5.filter(|md5| is_md5_hex(md5)).unwrap_or_default();
                        Some((rel, md5))
                    })
                    .collect();
                info!(
                    backend = %self.store.storage_type(),
                    prefix = %self.config.prefix,
                    objects = entries.len(),
                    "Populated published path cache"
                );
                Ok(entries)
            })
            .await?;
        Ok(())
    }

    /// MD5 of the object at `path`, downloading it when neither our metadata
    /// nor the provider knows the digest. `None` if it no longer exists.
    async fn remote_md5(&self, path: &str) -> Result<Option<String>> {
        let key = self.key(path);
        let meta = retry_with_backoff(&RetryConfig::quick(), "head_object", &self.cancel, || {
            self.store.head_object(&key)
        })
        .await?;
        let Some(meta) = meta else {
            return Ok(None);
        };
        if let Some(md5) = meta.content_md5() {
            return Ok(Some(md5));
        }

        debug!(path, "Downloading object to compute its MD5");
        match retry_with_backoff(&self.config.retry, "get_object", &self.cancel, || {
            self.store.get_object(&key)
        })
        .await
        {
            Ok(data) => Ok(Some(md5_hex(&data))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, path: &str, data: Bytes, md5: &str) -> Result<()> {
        let key = self.key(path);
        let metadata = Metadata::from([(MD5_METADATA_KEY.to_string(), md5.to_string())]);
        retry_with_backoff(&self.config.retry, "put_object", &self.cancel, || {
            self.store.put_object(&key, data.clone(), &metadata)
        })
        .await
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        retry_with_backoff(&self.config.retry, "delete_object", &self.cancel, || {
            self.store.delete_object(key)
        })
        .await
    }

    /// Locks two paths in a fixed order.
    async fn lock_pair(&self, a: &str, b: &str) -> Vec<KeyedGuard> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut guards = vec![self.locks.lock(first).await];
        if first != second {
            guards.push(self.locks.lock(second).await);
        }
        guards
    }

    /// Server-side copy of `src` to `dst` carrying the MD5, and the link
    /// target when emulating a symlink.
    async fn copy_as_link(&self, src: &str, dst: &str, symlink: bool) -> Result<()> {
        let _guard = self.locks.lock(dst).await;
        let md5 = self
            .remote_md5(src)
            .await?
            .ok_or_else(|| Error::not_found(src))?;

        let mut metadata = Metadata::from([(MD5_METADATA_KEY.to_string(), md5.clone())]);
        if symlink {
            metadata.insert(SYMLINK_METADATA_KEY.to_string(), src.to_string());
        }
        let (src_key, dst_key) = (self.key(src), self.key(dst));
        retry_with_backoff(&self.config.retry, "copy_object", &self.cancel, || {
            self.store.copy_object(&src_key, &dst_key, Some(&metadata))
        })
        .await?;
        self.path_cache.record(dst, &md5);
        Ok(())
    }
}

fn is_dists_dir(prefix: &str) -> bool {
    prefix.trim_end_matches('/').rsplit('/').next() == Some("dists")
}

#[async_trait]
impl<S: ObjectStore + 'static> PublishedStorage for RemotePublishedStorage<S> {
    async fn mkdir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn put_file(&self, path: &str, source: &Path) -> Result<()> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let md5 = md5_hex(&data);
        let _guard = self.locks.lock(path).await;
        self.upload(path, data, &md5).await?;
        self.path_cache.record(path, &md5);
        debug!(path, "Uploaded file");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let _guard = self.locks.lock(path).await;
        self.delete_key(&self.key(path)).await?;
        self.path_cache.forget(path);
        Ok(())
    }

    async fn remove_dirs(&self, path: &str, progress: &dyn ProgressSink) -> Result<()> {
        let keys: Vec<String> = self
            .list_all(&self.dir_prefix(path))
            .await?
            .into_iter()
            .map(|object| object.key)
            .collect();

        progress.start(keys.len() as u64);
        let mut bulk = true;
        for batch in keys.chunks(self.config.delete_batch_size.max(1)) {
            // keys arrive sorted, so batch locks are taken in the same order
            // as every other multi-path lock
            let mut guards = Vec::with_capacity(batch.len());
            for key in batch {
                if let Some(rel) = self.relative(key) {
                    guards.push(self.locks.lock(rel).await);
                }
            }

            let mut deleted = false;
            if bulk {
                match retry_with_backoff(&self.config.retry, "delete_objects", &self.cancel, || {
                    self.store.delete_objects(batch)
                })
                .await
                {
                    Ok(()) => deleted = true,
                    Err(Error::Unsupported { .. }) => bulk = false,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(path, error = %e, "Bulk delete failed, deleting objects one by one")
                    }
                }
            }
            if !deleted {
                for key in batch {
                    self.delete_key(key).await?;
                }
            }
            for key in batch {
                if let Some(rel) = self.relative(key) {
                    self.path_cache.forget(rel);
                }
            }
            drop(guards);
            progress.advance(batch.len() as u64);
        }
        progress.finish();

        info!(path, objects = keys.len(), "Removed published directory");
        Ok(())
    }

    async fn link_from_pool(&self, request: LinkRequest<'_>) -> Result<()> {
        let path = request.destination();
        let _guard = self.locks.lock(&path).await;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.ensure_path_cache().await?;
        let source_md5 = request.checksums.md5.as_deref().filter(|md5| !md5.is_empty());

        if let Some(cached) = self.path_cache.get(&path) {
            let source_md5 = source_md5.ok_or_else(|| {
                Error::InvalidInput(format!(
                    "cannot compare {} with existing object, MD5 checksum missing",
                    path
                ))
            })?;
            let existing = if cached.is_empty() {
                self.remote_md5(&path).await?
            } else {
                Some(cached)
            };
            match existing {
                Some(existing) if existing.eq_ignore_ascii_case(source_md5) => {
                    self.path_cache.record(&path, &existing);
                    debug!(path = %path, "Destination already holds identical content");
                    return Ok(());
                }
                Some(existing) if !request.force => {
                    return Err(Error::conflict(
                        &path,
                        format!(
                            "file already exists and is different (existing MD5 {}, new MD5 {})",
                            existing, source_md5
                        ),
                    ));
                }
                Some(_) => {
                    info!(path = %path, "Overwriting destination with different content");
                }
                None => self.path_cache.forget(&path),
            }
        }

        let data = read_pool_object(request.pool, request.pool_path).await?;
        let actual_md5 = md5_hex(&data);
        if let Some(expected) = source_md5 {
            if !expected.eq_ignore_ascii_case(&actual_md5) {
                return Err(Error::ChecksumMismatch {
                    path: request.pool_path.to_string(),
                    field: "md5",
                    expected: expected.to_string(),
                    actual: actual_md5,
                });
            }
        }

        self.upload(&path, data, &actual_md5).await?;
        self.path_cache.record(&path, &actual_md5);
        info!(
            backend = %self.store.storage_type(),
            path = %path,
            pool_path = request.pool_path,
            "Linked pool object"
        );
        Ok(())
    }

    async fn filelist(&self, prefix: &str) -> Result<Vec<String>> {
        let list_prefix = self.dir_prefix(prefix);
        let mut files: Vec<String> = self
            .list_all(&list_prefix)
            .await?
            .into_iter()
            .filter_map(|object| {
                object
                    .key
                    .strip_prefix(&list_prefix)
                    .map(|rel| rel.to_string())
            })
            .collect();
        files.sort();
        Ok(files)
    }

    async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let _guards = self.lock_pair(old, new).await;
        let (src, dst) = (self.key(old), self.key(new));

        let lease = retry_with_backoff(&RetryConfig::quick(), "acquire_lease", &self.cancel, || {
            self.store.acquire_lease(&src)
        })
        .await?;
        let copied = retry_with_backoff(&self.config.retry, "copy_object", &self.cancel, || {
            self.store.copy_object(&src, &dst, None)
        })
        .await;
        let released = match &lease {
            Some(lease) => self.store.release_lease(lease).await,
            None => Ok(()),
        };
        copied?;
        released?;
        self.delete_key(&src).await?;

        match self.path_cache.get(old) {
            Some(md5) => self.path_cache.record(new, &md5),
            None => self.path_cache.forget(new),
        }
        self.path_cache.forget(old);
        debug!(old, new, "Renamed object");
        Ok(())
    }

    async fn symlink(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_as_link(src, dst, true).await
    }

    async fn hard_link(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_as_link(src, dst, false).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        let meta = retry_with_backoff(&RetryConfig::quick(), "head_object", &self.cancel, || {
            self.store.head_object(&key)
        })
        .await?;
        Ok(meta.is_some())
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let key = self.key(path);
        let meta = retry_with_backoff(&RetryConfig::quick(), "head_object", &self.cancel, || {
            self.store.head_object(&key)
        })
        .await?
        .ok_or_else(|| Error::not_found(path))?;
        meta.metadata
            .get(SYMLINK_METADATA_KEY)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("{} is not a symlink", path)))
    }

    fn storage_type(&self) -> StorageType {
        self.store.storage_type()
    }
}
