//! Content-addressable package pool.
//!
//! Every package file lives exactly once in the pool, at a path derived from
//! its digest (see [`paths::pool_path`]). Published trees link to pool
//! objects instead of holding their own copies.
//!
//! ```text
//! pool/
//! ├── c7/
//! │   └── 6b/
//! │       └── 4bd12fd92e4dfe1b55b18a67a669_hello_1.0_amd64.deb
//! └── ...
//! ```

use crate::cache::ChecksumCache;
use crate::paths;
use crate::progress::ProgressSink;
use crate::{ChecksumSet, Error, HashSelector, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::{debug, info};
use walkdir::WalkDir;

/// A readable, seekable handle on a pool object.
pub trait PoolReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> PoolReader for T {}

pub type PoolFile = Box<dyn PoolReader>;

#[async_trait]
pub trait PackagePool: Send + Sync {
    /// The digest used to address objects. Reading it fixes it for the
    /// lifetime of the pool.
    fn hash_selector(&self) -> HashSelector;

    /// Chooses the digest once. Fails if a different one is already fixed.
    fn set_hash_selector(&self, selector: HashSelector) -> Result<()>;

    /// Stores `source` in the pool and returns its pool path. `checksums` is
    /// completed in place and recorded in `cache`.
    async fn import(
        &self,
        source: &Path,
        basename: &str,
        checksums: &mut ChecksumSet,
        move_source: bool,
        cache: &dyn ChecksumCache,
    ) -> Result<String>;

    /// Checks whether content matching `checksums` is present. Returns the
    /// pool path (derived when `pool_path` is `None`) and whether it matched.
    async fn verify(
        &self,
        pool_path: Option<&str>,
        basename: &str,
        checksums: &mut ChecksumSet,
        cache: &dyn ChecksumCache,
    ) -> Result<(String, bool)>;

    async fn open(&self, path: &str) -> Result<PoolFile>;

    async fn size(&self, path: &str) -> Result<u64>;

    /// Deletes an object and returns the number of bytes freed.
    async fn remove(&self, path: &str) -> Result<u64>;

    /// Every object path in the pool, sorted.
    async fn filepath_list(&self, progress: &dyn ProgressSink) -> Result<Vec<String>>;

    /// Filesystem location of an object, for pools that keep objects on a
    /// local disk.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Holds a pool's hash selector: settable once, defaulted on first read.
#[derive(Debug, Default)]
pub struct SelectorCell(OnceLock<HashSelector>);

impl SelectorCell {
    pub fn new(selector: Option<HashSelector>) -> Self {
        let cell = OnceLock::new();
        if let Some(selector) = selector {
            let _ = cell.set(selector);
        }
        Self(cell)
    }

    pub fn get(&self) -> HashSelector {
        *self.0.get_or_init(HashSelector::default)
    }

    pub fn set(&self, selector: HashSelector) -> Result<()> {
        if self.0.set(selector).is_ok() || self.get() == selector {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "hash selector already fixed to {}, cannot switch to {}",
                self.get(),
                selector
            )))
        }
    }
}

/// Completes `checksums` from the file at `source`, failing if a value the
/// caller supplied disagrees with the file.
pub async fn complete_source_checksums(source: &Path, checksums: &mut ChecksumSet) -> Result<()> {
    if checksums.is_complete() {
        return Ok(());
    }
    let computed = ChecksumSet::for_file(source).await.map_err(|e| {
        if e.is_not_found() {
            Error::SourceNotFound {
                path: source.display().to_string(),
            }
        } else {
            e
        }
    })?;
    checksums.check_against(&source.display().to_string(), &computed)?;
    checksums.backfill(&computed);
    Ok(())
}

/// Pool path for `checksums` under `selector`, or `None` when that digest is
/// unknown.
pub fn derive_pool_path(
    selector: HashSelector,
    checksums: &ChecksumSet,
    basename: &str,
) -> Result<Option<String>> {
    checksums
        .get(selector)
        .map(|hash| paths::pool_path(hash, basename))
        .transpose()
}

/// Package pool on a local filesystem.
#[derive(Debug)]
pub struct LocalPool {
    root: PathBuf,
    selector: SelectorCell,
}

impl LocalPool {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            selector: SelectorCell::default(),
        }
    }

    pub fn with_hash_selector<P: AsRef<Path>>(root: P, selector: HashSelector) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            selector: SelectorCell::new(Some(selector)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Dedup hit: the existing object must be the same content.
    async fn accept_existing(
        &self,
        pool_path: &str,
        full_path: &Path,
        checksums: &mut ChecksumSet,
        cache: &dyn ChecksumCache,
    ) -> Result<()> {
        let size = fs::metadata(full_path).await?.len();
        if size != checksums.size {
            return Err(Error::conflict(
                pool_path,
                format!(
                    "cannot import: pool object exists with different size ({} != {})",
                    size, checksums.size
                ),
            ));
        }

        let existing = match cache.get(pool_path).await? {
            Some(cached) if cached.is_complete() && cached.size == size => cached,
            _ => ChecksumSet::for_file(full_path).await?,
        };
        if let Some((field, _, _)) = checksums.first_mismatch(&existing) {
            return Err(Error::conflict(
                pool_path,
                format!("cannot import: pool object exists with different {}", field),
            ));
        }
        checksums.backfill(&existing);
        debug!(pool_path, "Pool already holds identical content");
        Ok(())
    }
}

/// Puts `source` at `dest` unless something already lives there. Returns
/// `false` when `dest` was occupied.
fn place_file(source: &Path, dest: &Path, move_source: bool) -> std::io::Result<bool> {
    if move_source {
        match std::fs::hard_link(source, dest) {
            Ok(()) => {
                std::fs::remove_file(source)?;
                return Ok(true);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            // cross-device or no hardlink support: copy instead
            Err(_) => {}
        }
    }

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut src = std::fs::File::open(source)?;
    std::io::copy(&mut src, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
    }

    match tmp.persist_noclobber(dest) {
        Ok(_) => {}
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.error),
    }
    if move_source {
        std::fs::remove_file(source)?;
    }
    Ok(true)
}

#[async_trait]
impl PackagePool for LocalPool {
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
        match fs::metadata(source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(Error::InvalidInput(format!(
                    "{} is not a regular file",
                    source.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::SourceNotFound {
                    path: source.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        complete_source_checksums(source, checksums).await?;
        let selector = self.hash_selector();
        let pool_path = derive_pool_path(selector, checksums, basename)?.ok_or_else(|| {
            Error::InvalidInput(format!("{} digest missing for {}", selector, basename))
        })?;
        let full_path = self.full_path(&pool_path);

        let exists = match fs::metadata(&full_path).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let deduplicated = if exists {
            self.accept_existing(&pool_path, &full_path, checksums, cache)
                .await?;
            true
        } else {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let source_owned = source.to_path_buf();
            let dest = full_path.clone();
            let placed = tokio::task::spawn_blocking(move || {
                place_file(&source_owned, &dest, move_source)
            })
            .await??;

            if placed {
                info!(pool_path = %pool_path, moved = move_source, "Imported package file into pool");
            } else {
                // lost a race against an identical import
                self.accept_existing(&pool_path, &full_path, checksums, cache)
                    .await?;
            }
            !placed
        };

        if deduplicated && move_source {
            fs::remove_file(source).await?;
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
        let full_path = self.full_path(&pool_path);

        let size = match fs::metadata(&full_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((pool_path, false)),
            Err(e) => return Err(e.into()),
        };
        if size != checksums.size {
            return Ok((pool_path, false));
        }

        let existing = match cache.get(&pool_path).await? {
            Some(cached) if cached.is_complete() && cached.size == size => cached,
            _ => {
                let computed = ChecksumSet::for_file(&full_path).await?;
                cache.update(&pool_path, &computed).await?;
                computed
            }
        };
        if checksums.first_mismatch(&existing).is_some() {
            return Ok((pool_path, false));
        }

        checksums.backfill(&existing);
        Ok((pool_path, true))
    }

    async fn open(&self, path: &str) -> Result<PoolFile> {
        match fs::File::open(self.full_path(path)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn size(&self, path: &str) -> Result<u64> {
        match fs::metadata(self.full_path(path)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, path: &str) -> Result<u64> {
        let full_path = self.full_path(path);
        let size = self.size(path).await?;
        fs::remove_file(&full_path).await?;
        debug!(path, size, "Removed pool object");
        Ok(size)
    }

    async fn filepath_list(&self, progress: &dyn ProgressSink) -> Result<Vec<String>> {
        let root = self.root.clone();
        let shards: Vec<PathBuf> = match std::fs::read_dir(&root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        progress.start(shards.len() as u64);
        let mut result = Vec::new();
        for shard in shards {
            let root = root.clone();
            let files = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                let mut files = Vec::new();
                for entry in WalkDir::new(&shard).min_depth(1) {
                    let entry = entry.map_err(|e| Error::Other(e.to_string()))?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Ok(rel) = entry.path().strip_prefix(&root) {
                        files.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
                Ok(files)
            })
            .await??;
            result.extend(files);
            progress.advance(1);
        }
        progress.finish();

        result.sort();
        Ok(result)
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.full_path(path))
    }
}
