use dashmap::DashMap;
use debpool_core::Result;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::OnceCell;

/// Published path → MD5 of the object stored there.
///
/// Filled by one full listing the first time it is needed; concurrent first
/// users wait for that listing instead of starting their own. A failed or
/// cancelled listing leaves the cache unpopulated so the next caller retries.
#[derive(Debug, Default)]
pub struct PathCache {
    entries: OnceCell<DashMap<String, String>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_populate<F, Fut>(&self, populate: F) -> Result<&DashMap<String, String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<String, String>>>,
    {
        self.entries
            .get_or_try_init(|| async move {
                let listed = populate().await?;
                Ok(listed.into_iter().collect::<DashMap<_, _>>())
            })
            .await
    }

    pub fn is_populated(&self) -> bool {
        self.entries.initialized()
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.entries
            .get()
            .and_then(|entries| entries.get(path).map(|md5| md5.value().clone()))
    }

    /// Records a successful write. Ignored until the cache is populated; the
    /// listing will pick the object up.
    pub fn record(&self, path: &str, md5: &str) {
        if let Some(entries) = self.entries.get() {
            entries.insert(path.to_string(), md5.to_string());
        }
    }

    pub fn forget(&self, path: &str) {
        if let Some(entries) = self.entries.get() {
            entries.remove(path);
        }
    }

    /// Drops every entry at or below `prefix`.
    pub fn forget_prefix(&self, prefix: &str) {
        if let Some(entries) = self.entries.get() {
            if prefix.is_empty() {
                entries.clear();
                return;
            }
            let dir = format!("{}/", prefix.trim_end_matches('/'));
            entries.retain(|path, _| path != prefix && !path.starts_with(&dir));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.get().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debpool_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_populated_once_under_concurrency() {
        let cache = Arc::new(PathCache::new());
        let listings = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let listings = listings.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_populate(|| async {
                        listings.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(HashMap::from([("a".to_string(), "md5a".to_string())]))
                    })
                    .await
                    .map(|entries| entries.len())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }
        assert_eq!(listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_population_is_retried() {
        let cache = PathCache::new();
        let failed = cache
            .get_or_populate(|| async { Err(Error::Backend("timeout".to_string())) })
            .await;
        assert!(failed.is_err());
        assert!(!cache.is_populated());

        cache.record("ignored", "x");
        assert!(cache.get("ignored").is_none());

        cache
            .get_or_populate(|| async { Ok(HashMap::new()) })
            .await
            .unwrap();
        cache.record("dists/stable/Release", "abc");
        assert_eq!(cache.get("dists/stable/Release").as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_forget_prefix() {
        let cache = PathCache::new();
        cache
            .get_or_populate(|| async {
                Ok(HashMap::from([
                    ("test/a".to_string(), "1".to_string()),
                    ("test/b".to_string(), "2".to_string()),
                    ("testing/a".to_string(), "3".to_string()),
                    ("test".to_string(), "4".to_string()),
                ]))
            })
            .await
            .unwrap();

        cache.forget_prefix("test");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("testing/a").is_some());
    }
}
