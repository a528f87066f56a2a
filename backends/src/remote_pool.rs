use crate::object_store::{MD5_METADATA_KEY, Metadata, ObjectStore};
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use bytes::Bytes;
use debpool_core::paths::join_key;
use debpool_core::pool::{complete_source_checksums, derive_pool_path};
use debpool_core::{
    ChecksumCache, ChecksumSet, Error, HashSelector, PackagePool, PoolFile, ProgressSink, Result,
    SelectorCell,
};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Package pool kept in an object store, under `<prefix>/<pool path>`.
pub struct RemotePool<S: ObjectStore> {
    store: Arc<S>,
    prefix: String,
    selector: SelectorCell,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl<S: ObjectStore> RemotePool<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            selector: SelectorCell::default(),
            retry: RetryConfig::persistent(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hash_selector(self, selector: HashSelector) -> Self {
        Self {
            selector: SelectorCell::new(Some(selector)),
            ..self
        }
    }

    pub fn with_retry(self, retry: RetryConfig) -> Self {
        Self { retry, ..self }
    }

    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }

    fn key(&self, path: &str) -> String {
        join_key(&[self.prefix.as_str(), path])
    }

    async fn head_size(&self, path: &str) -> Result<Option<u64>> {
        let key = self.key(path);
        let meta = retry_with_backoff(&RetryConfig::quick(), "head_object", &self.cancel, || {
            self.store.head_object(&key)
        })
        .await?;
        Ok(meta.map(|meta| meta.size))
    }

    async fn download(&self, path: &str) -> Result<Bytes> {
        let key = self.key(path);
        retry_with_backoff(&self.retry, "get_object", &self.cancel, || {
            self.store.get_object(&key)
        })
        .await
        .map_err(|e| if e.is_not_found() { Error::not_found(path) } else { e })
    }

    /// Checksums of the stored object, from `cache` when it has a complete
    /// entry of the right size.
    async fn stored_checksums(
        &self,
        path: &str,
        size: u64,
        cache: &dyn ChecksumCache,
    ) -> Result<ChecksumSet> {
        if let Some(cached) = cache.get(path).await? {
            if cached.is_complete() && cached.size == size {
                return Ok(cached);
            }
        }
        let data = self.download(path).await?;
        let computed = ChecksumSet::compute_bytes(&data);
        cache.update(path, &computed).await?;
        Ok(computed)
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> PackagePool for RemotePool<S> {
    fn hash_selector(&self) -> HashSelector {
        self.selector.get()
    }

    fn set_hash_selector(&self, selector: HashSelector) -> Result<()> {
        self.selector.set(selector)
    }

    async fn import(
        &self,
        source: &Path,
        basename: &str,
        checksums: &mut ChecksumSet,
        move_source: bool,
        cache: &dyn ChecksumCache,
    ) -> Result<String> {
        complete_source_checksums(source, checksums).await?;
        let selector = self.hash_selector();
        let pool_path = derive_pool_path(selector, checksums, basename)?.ok_or_else(|| {
            Error::InvalidInput(format!("{} digest missing for {}", selector, basename))
        })?;

        if let Some(size) = self.head_size(&pool_path).await? {
            if size != checksums.size {
                return Err(Error::conflict(
                    &pool_path,
                    format!(
                        "cannot import: pool object exists with different size ({} != {})",
                        size, checksums.size
                    ),
                ));
            }
            let existing = self.stored_checksums(&pool_path, size, cache).await?;
            if let Some((field, _, _)) = checksums.first_mismatch(&existing) {
                return Err(Error::conflict(
                    &pool_path,
                    format!("cannot import: pool object exists with different {}", field),
                ));
            }
            checksums.backfill(&existing);
            debug!(pool_path = %pool_path, "Pool already holds identical content");
        } else {
            let data = Bytes::from(tokio::fs::read(source).await?);
            let key = self.key(&pool_path);
            let metadata = Metadata::from([(
                MD5_METADATA_KEY.to_string(),
                checksums.md5.clone().unwrap_or_default(),
            )]);
            retry_with_backoff(&self.retry, "put_object", &self.cancel, || {
                self.store.put_object(&key, data.clone(), &metadata)
            })
            .await?;
            info!(
                backend = %self.store.storage_type(),
                pool_path = %pool_path,
                "Imported package file into pool"
            );
        }

        if move_source {
            tokio::fs::remove_file(source).await?;
        }
        cache.update(&pool_path, checksums).await?;
        Ok(pool_path)
    }

    async fn verify(
        &self,
        pool_path: Option<&str>,
        basename: &str,
        checksums: &mut ChecksumSet,
        cache: &dyn ChecksumCache,
    ) -> Result<(String, bool)> {
        let pool_path = match pool_path.filter(|p| !p.is_empty()) {
            Some(path) => path.to_string(),
            None => match derive_pool_path(self.hash_selector(), checksums, basename)? {
                Some(path) => path,
                None => return Ok((String::new(), false)),
            },
        };

        let Some(size) = self.head_size(&pool_path).await? else {
            return Ok((pool_path, false));
        };
        if size != checksums.size {
            return Ok((pool_path, false));
        }

        let existing = self.stored_checksums(&pool_path, size, cache).await?;
        if checksums.first_mismatch(&existing).is_some() {
            return Ok((pool_path, false));
        }
        checksums.backfill(&existing);
        Ok((pool_path, true))
    }

    async fn open(&self, path: &str) -> Result<PoolFile> {
        let data = self.download(path).await?;
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let mut file = tempfile::tempfile()?;
            file.write_all(&data)?;
            file.seek(SeekFrom::Start(0))?;
            Ok(file)
        })
        .await??;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    async fn size(&self, path: &str) -> Result<u64> {
        self.head_size(path)
            .await?
            .ok_or_else(|| Error::not_found(path))
    }

    async fn remove(&self, path: &str) -> Result<u64> {
        let size = self.size(path).await?;
        let key = self.key(path);
        retry_with_backoff(&self.retry, "delete_object", &self.cancel, || {
            self.store.delete_object(&key)
        })
        .await?;
        debug!(path, size, "Removed pool object");
        Ok(size)
    }

    async fn filepath_list(&self, progress: &dyn ProgressSink) -> Result<Vec<String>> {
        let prefix = match self.key("") {
            key if key.is_empty() => key,
            key => format!("{}/", key),
        };

        let mut paths = Vec::new();
        let mut marker: Option<String> = None;
        progress.start(0);
        loop {
            let page = retry_with_backoff(&RetryConfig::quick(), "list_objects", &self.cancel, || {
                self.store.list_page(&prefix, None, marker.as_deref())
            })
            .await?;
            progress.advance(page.objects.len() as u64);
            paths.extend(
                page.objects
                    .into_iter()
                    .filter_map(|object| object.key.strip_prefix(&prefix).map(str::to_string)),
            );
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        progress.finish();

        paths.sort();
        Ok(paths)
    }
}
