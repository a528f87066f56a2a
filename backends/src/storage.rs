use async_trait::async_trait;
use debpool_core::{ChecksumSet, PackagePool, ProgressSink, Result};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Local,
    S3,
    Azure,
    Swift,
    Sftp,
    Memory,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::S3 => "s3",
            StorageType::Azure => "azure",
            StorageType::Swift => "swift",
            StorageType::Sftp => "sftp",
            StorageType::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pool object to project into a published tree.
///
/// The destination is `<published_prefix>/<published_rel_path>/<file_name>`
/// relative to the storage root.
#[derive(Clone, Copy)]
pub struct LinkRequest<'a> {
    pub published_prefix: &'a str,
    pub published_rel_path: &'a str,
    pub file_name: &'a str,
    pub pool: &'a dyn PackagePool,
    pub pool_path: &'a str,
    pub checksums: &'a ChecksumSet,
    /// Overwrite a destination holding different content.
    pub force: bool,
}

impl LinkRequest<'_> {
    /// Destination relative to the storage root.
    pub fn destination(&self) -> String {
        debpool_core::paths::join_key(&[
            self.published_prefix,
            self.published_rel_path,
            self.file_name,
        ])
    }
}

impl fmt::Debug for LinkRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRequest")
            .field("destination", &self.destination())
            .field("pool_path", &self.pool_path)
            .field("force", &self.force)
            .finish()
    }
}

/// The served repository tree.
///
/// All paths are relative to the storage root and use `/` separators.
#[async_trait]
pub trait PublishedStorage: Send + Sync {
    /// Creates a directory and its parents. No-op on flat namespaces.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Uploads a local file, replacing whatever is at `path`.
    async fn put_file(&self, path: &str, source: &Path) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Deletes everything below `path`.
    async fn remove_dirs(&self, path: &str, progress: &dyn ProgressSink) -> Result<()>;

    /// Places a pool object at the request's destination.
    ///
    /// A destination that already holds the same content (by MD5) is left
    /// alone. Different content is a [`Conflict`](debpool_core::Error::Conflict)
    /// unless `force` is set, in which case it is replaced. Callers racing on
    /// the same destination are serialized.
    async fn link_from_pool(&self, request: LinkRequest<'_>) -> Result<()>;

    /// Files below `prefix`, relative to it, sorted.
    async fn filelist(&self, prefix: &str) -> Result<Vec<String>>;

    async fn rename_file(&self, old: &str, new: &str) -> Result<()>;

    async fn symlink(&self, src: &str, dst: &str) -> Result<()>;

    async fn hard_link(&self, src: &str, dst: &str) -> Result<()>;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// Target recorded by [`symlink`](Self::symlink).
    async fn read_link(&self, path: &str) -> Result<String>;

    fn storage_type(&self) -> StorageType;
}

/// Reads a whole pool object into memory for an upload.
pub async fn read_pool_object(pool: &dyn PackagePool, path: &str) -> Result<bytes::Bytes> {
    use tokio::io::AsyncReadExt;

    let mut reader = pool.open(path).await?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data.into())
}
