//! An object store held in process memory.
//!
//! Behaves like a small S3 bucket: flat keys, paginated listings with
//! delimiter support, server-side copy, optional bulk delete and leases.
//! Used for dry runs and as the fixture behind the remote storage tests.

use crate::object_store::{
    ListPage, Lease, Metadata, ObjectEntry, ObjectMeta, ObjectStore, md5_hex,
};
use crate::storage::StorageType;
use async_trait::async_trait;
use bytes::Bytes;
use debpool_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: Metadata,
}

#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    leases: Mutex<HashMap<String, String>>,
    page_size: usize,
    bulk_delete: bool,
    leases_enabled: bool,
    multipart_etags: bool,
    failing_puts: AtomicUsize,
    list_calls: AtomicUsize,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
    bulk_delete_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            leases: Mutex::new(HashMap::new()),
            page_size: 1000,
            bulk_delete: true,
            leases_enabled: false,
            multipart_etags: false,
            failing_puts: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            bulk_delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn without_bulk_delete(mut self) -> Self {
        self.bulk_delete = false;
        self
    }

    pub fn with_leases(mut self) -> Self {
        self.leases_enabled = true;
        self
    }

    /// Reports digests the way S3 does for multipart uploads: listings carry
    /// an ETag with a `-N` part count and HEAD knows no MD5.
    pub fn with_multipart_etags(mut self) -> Self {
        self.multipart_etags = true;
        self
    }

    /// Makes the next `count` uploads fail with a transient error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn bulk_delete_calls(&self) -> usize {
        self.bulk_delete_calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock_objects().keys().cloned().collect()
    }

    pub fn data(&self, key: &str) -> Option<Bytes> {
        self.lock_objects().get(key).map(|o| o.data.clone())
    }

    /// Stores an object as a foreign uploader would: no MD5 metadata.
    pub fn insert_raw(&self, key: &str, data: impl Into<Bytes>) {
        self.lock_objects().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                metadata: Metadata::new(),
            },
        );
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listed_md5(&self, data: &[u8]) -> String {
        if self.multipart_etags {
            format!("{}-2", md5_hex(data))
        } else {
            md5_hex(data)
        }
    }

    fn check_unleased(&self, key: &str) -> Result<()> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.contains_key(key) {
            return Err(Error::Backend(format!("{} is leased", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    async fn put_object(&self, key: &str, data: Bytes, metadata: &Metadata) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::Backend("injected failure: connection reset".to_string()));
        }
        self.check_unleased(key)?;
        self.lock_objects().insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.lock_objects()
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found(key))
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.lock_objects().get(key).map(|o| ObjectMeta {
            size: o.data.len() as u64,
            md5: (!self.multipart_etags).then(|| md5_hex(&o.data)),
            metadata: o.metadata.clone(),
        }))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_unleased(key)?;
        self.lock_objects().remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        if !self.bulk_delete {
            return Err(Error::Unsupported {
                backend: "memory",
                operation: "bulk delete",
            });
        }
        self.bulk_delete_calls.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            self.check_unleased(key)?;
        }
        let mut objects = self.lock_objects();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.lock_objects();

        // Objects and collapsed prefixes share one ordered name space.
        let mut names: BTreeMap<String, Option<ObjectEntry>> = BTreeMap::new();
        let mut seen_prefixes = BTreeSet::new();
        for (key, object) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            if let Some(delim) = delimiter {
                if let Some(idx) = rest.find(delim) {
                    let common = format!("{}{}", prefix, &rest[..idx + delim.len()]);
                    if seen_prefixes.insert(common.clone()) {
                        names.insert(common, None);
                    }
                    continue;
                }
            }
            names.insert(
                key.clone(),
                Some(ObjectEntry {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    md5: Some(self.listed_md5(&object.data)),
                }),
            );
        }

        let mut page = ListPage::default();
        let mut remaining = names
            .into_iter()
            .filter(|(name, _)| marker.is_none_or(|m| name.as_str() > m))
            .peekable();
        let mut taken = 0;
        while taken < self.page_size {
            let Some((name, entry)) = remaining.next() else {
                break;
            };
            taken += 1;
            match entry {
                Some(entry) => page.objects.push(entry),
                None => page.common_prefixes.push(name.clone()),
            }
            if taken == self.page_size && remaining.peek().is_some() {
                page.next_marker = Some(name);
            }
        }
        Ok(page)
    }

    async fn copy_object(&self, src: &str, dst: &str, metadata: Option<&Metadata>) -> Result<()> {
        self.check_unleased(dst)?;
        let mut objects = self.lock_objects();
        let source = objects.get(src).cloned().ok_or_else(|| Error::not_found(src))?;
        objects.insert(
            dst.to_string(),
            StoredObject {
                data: source.data,
                metadata: metadata.cloned().unwrap_or(source.metadata),
            },
        );
        Ok(())
    }

    async fn acquire_lease(&self, key: &str) -> Result<Option<Lease>> {
        if !self.leases_enabled {
            return Ok(None);
        }
        if !self.lock_objects().contains_key(key) {
            return Err(Error::not_found(key));
        }
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.contains_key(key) {
            return Err(Error::conflict(key, "already leased"));
        }
        let id = format!("{:032x}", rand::random::<u128>());
        leases.insert(key.to_string(), id.clone());
        Ok(Some(Lease {
            key: key.to_string(),
            id,
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(&lease.key) {
            Some(id) if *id == lease.id => {
                leases.remove(&lease.key);
                Ok(())
            }
            _ => Err(Error::Backend(format!("lease on {} not held", lease.key))),
        }
    }
}
