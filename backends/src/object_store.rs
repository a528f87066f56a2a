//! The primitives every flat-namespace object store offers.
//!
//! [`RemotePublishedStorage`](crate::remote::RemotePublishedStorage) and
//! [`RemotePool`](crate::remote_pool::RemotePool) are written once against
//! this trait; S3, Azure Blob and Swift only translate these calls.

use crate::storage::StorageType;
use async_trait::async_trait;
use bytes::Bytes;
use debpool_core::{Error, Result};
use std::collections::HashMap;

/// User metadata key holding the hex MD5 of an object we uploaded.
pub const MD5_METADATA_KEY: &str = "md5";

/// User metadata key holding the target of an emulated symlink.
pub const SYMLINK_METADATA_KEY: &str = "symlink";

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Hex MD5 of the content when the provider reports one.
    pub md5: Option<String>,
    pub metadata: Metadata,
}

impl ObjectMeta {
    /// Our own MD5 metadata first, then whatever the provider reports.
    pub fn content_md5(&self) -> Option<String> {
        self.metadata
            .get(MD5_METADATA_KEY)
            .filter(|md5| is_md5_hex(md5))
            .cloned()
            .or_else(|| self.md5.clone().filter(|md5| is_md5_hex(md5)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    /// With a delimiter: the "directories" directly below the prefix, each
    /// ending in the delimiter.
    pub common_prefixes: Vec<String>,
    /// Opaque continuation marker; `None` on the last page.
    pub next_marker: Option<String>,
}

/// A hold on an object that keeps other writers away from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub id: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn storage_type(&self) -> StorageType;

    async fn put_object(&self, key: &str, data: Bytes, metadata: &Metadata) -> Result<()>;

    /// Fails with [`Error::NotFound`] for a missing key.
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    /// `Ok(None)` for a missing key.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Deletes several keys in one request, where the provider can.
    async fn delete_objects(&self, _keys: &[String]) -> Result<()> {
        Err(Error::Unsupported {
            backend: self.storage_type().as_str(),
            operation: "bulk delete",
        })
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<ListPage>;

    /// Server-side copy. `metadata` replaces the source's metadata when set.
    async fn copy_object(&self, src: &str, dst: &str, metadata: Option<&Metadata>) -> Result<()>;

    /// Takes a lease on `key` where the provider supports leases.
    async fn acquire_lease(&self, _key: &str) -> Result<Option<Lease>> {
        Ok(None)
    }

    async fn release_lease(&self, _lease: &Lease) -> Result<()> {
        Ok(())
    }
}

pub fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// S3 and Swift quote their ETags; multipart ETags carry a `-N` suffix and
/// are not content digests.
pub fn md5_from_etag(etag: &str) -> Option<String> {
    let etag = etag.trim_matches('"').to_ascii_lowercase();
    is_md5_hex(&etag).then_some(etag)
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
