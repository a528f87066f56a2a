use crate::locks::KeyedLock;
use crate::storage::{LinkRequest, PublishedStorage, StorageType};
use async_trait::async_trait;
use debpool_core::{ChecksumSet, Error, ProgressSink, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How pool objects end up in a local published tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMethod {
    /// Hard link when pool and tree share a device, copy otherwise.
    #[default]
    Hardlink,
    Copy,
    Symlink,
}

pub struct LocalPublishedStorage {
    root: PathBuf,
    link_method: LinkMethod,
    locks: KeyedLock,
}

impl LocalPublishedStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self::with_link_method(root, LinkMethod::default())
    }

    pub fn with_link_method<P: AsRef<Path>>(root: P, link_method: LinkMethod) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            link_method,
            locks: KeyedLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn existing_md5(&self, dest: &Path) -> Result<Option<String>> {
        match fs::symlink_metadata(dest).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match ChecksumSet::for_file(dest).await {
            Ok(checksums) => Ok(checksums.md5),
            // dangling symlink: treat as empty content so it is replaced or reported
            Err(e) if e.is_not_found() => Ok(Some(String::new())),
            Err(e) => Err(e),
        }
    }

    async fn copy_from_pool(&self, request: &LinkRequest<'_>, dest: &Path) -> Result<()> {
        let dir = parent_dir(dest);
        let mut reader = request.pool.open(request.pool_path).await?;
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        let mut file = fs::File::from_std(tmp.reopen()?);
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            set_readable(tmp.path())?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn set_readable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent_dir(dest).join(format!(".{}.{:016x}.tmp", name, rand::random::<u64>()))
}

/// Creates the entry with `make` under a temporary name, then renames it over
/// `dest` so readers see either the old or the new file, never neither.
async fn replace_with<F>(dest: &Path, make: F) -> std::io::Result<()>
where
    F: FnOnce(&Path) -> std::io::Result<()> + Send + 'static,
{
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let tmp = temp_sibling(&dest);
        make(&tmp)?;
        if let Err(e) = std::fs::rename(&tmp, &dest) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

#[cfg(unix)]
fn same_device(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(a)?.dev() == std::fs::metadata(b)?.dev())
}

#[cfg(not(unix))]
fn same_device(_a: &Path, _b: &Path) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::copy(target, link).map(|_| ())
}

#[async_trait]
impl PublishedStorage for LocalPublishedStorage {
    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path)).await?;
        Ok(())
    }

    async fn put_file(&self, path: &str, source: &Path) -> Result<()> {
        let dest = self.full_path(path);
        let dir = parent_dir(&dest);
        fs::create_dir_all(&dir).await?;

        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut src = match std::fs::File::open(&source) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::SourceNotFound {
                        path: source.display().to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::copy(&mut src, tmp.as_file_mut())?;
            set_readable(tmp.path())?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_dirs(&self, path: &str, progress: &dyn ProgressSink) -> Result<()> {
        let full_path = self.full_path(path);
        progress.start(1);
        let result = match fs::remove_dir_all(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        progress.advance(1);
        progress.finish();
        debug!(path, "Removed published directory");
        result
    }

    async fn link_from_pool(&self, request: LinkRequest<'_>) -> Result<()> {
        let rel_path = request.destination();
        let dest = self.full_path(&rel_path);
        let _guard = self.locks.lock(&rel_path).await;

        let pool_file = request.pool.local_path(request.pool_path);

        let hardlinked = self.link_method == LinkMethod::Hardlink
            && pool_file.as_deref().is_some_and(|src| same_file(src, &dest));
        if hardlinked {
            debug!(path = %rel_path, "Destination already linked to pool object");
            return Ok(());
        }

        if let Some(existing) = self.existing_md5(&dest).await? {
            let source_md5 = request.checksums.md5.as_deref().ok_or_else(|| {
                Error::InvalidInput(format!(
                    "cannot compare {} with existing file, MD5 checksum missing",
                    rel_path
                ))
            })?;
            if existing.eq_ignore_ascii_case(source_md5) {
                debug!(path = %rel_path, "Destination already holds identical content");
                return Ok(());
            }
            if !request.force {
                return Err(Error::conflict(
                    &rel_path,
                    format!(
                        "file already exists and is different (existing MD5 {}, new MD5 {})",
                        existing, source_md5
                    ),
                ));
            }
            info!(path = %rel_path, "Overwriting destination with different content");
        }

        let dir = parent_dir(&dest);
        fs::create_dir_all(&dir).await?;

        let shares_device = match &pool_file {
            Some(src) if self.link_method == LinkMethod::Hardlink => same_device(src, &dir)?,
            _ => false,
        };

        match (self.link_method, pool_file) {
            (LinkMethod::Hardlink, Some(src)) if shares_device => {
                let link_src = src.clone();
                match replace_with(&dest, move |tmp| std::fs::hard_link(&link_src, tmp)).await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(path = %rel_path, error = %e, "Hard link failed, copying instead");
                        self.copy_from_pool(&request, &dest).await?;
                    }
                }
            }
            (LinkMethod::Symlink, Some(src)) => {
                replace_with(&dest, move |tmp| make_symlink(&src, tmp)).await?;
            }
            _ => self.copy_from_pool(&request, &dest).await?,
        }

        debug!(path = %rel_path, pool_path = request.pool_path, "Linked pool object");
        Ok(())
    }

    async fn filelist(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.full_path(prefix);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !base.is_dir() {
                return Ok(Vec::new());
            }
            let mut files = Vec::new();
            for entry in WalkDir::new(&base).min_depth(1) {
                let entry = entry.map_err(|e| Error::Other(e.to_string()))?;
                if entry.file_type().is_dir() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&base) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            files.sort();
            Ok(files)
        })
        .await?
    }

    async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let dest = self.full_path(new);
        fs::create_dir_all(parent_dir(&dest)).await?;
        match fs::rename(self.full_path(old), &dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(old)),
            Err(e) => Err(e.into()),
        }
    }

    async fn symlink(&self, src: &str, dst: &str) -> Result<()> {
        let target = self.full_path(src);
        let link = self.full_path(dst);
        fs::create_dir_all(parent_dir(&link)).await?;
        replace_with(&link, move |tmp| make_symlink(&target, tmp)).await?;
        Ok(())
    }

    async fn hard_link(&self, src: &str, dst: &str) -> Result<()> {
        let link = self.full_path(dst);
        fs::create_dir_all(parent_dir(&link)).await?;
        fs::hard_link(self.full_path(src), link).await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        match fs::symlink_metadata(self.full_path(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let target = fs::read_link(self.full_path(path)).await?;
        let rel = target.strip_prefix(&self.root).unwrap_or(&target);
        Ok(rel.to_string_lossy().replace('\\', "/"))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debpool_core::{LocalPool, MemoryChecksumCache, NoProgress, PackagePool};
    use std::sync::Arc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        pool: Arc<LocalPool>,
        storage: Arc<LocalPublishedStorage>,
        sources: PathBuf,
    }

    impl Fixture {
        fn new(link_method: LinkMethod) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let pool = Arc::new(LocalPool::new(tmp.path().join("pool")));
            let storage = Arc::new(LocalPublishedStorage::with_link_method(
                tmp.path().join("public"),
                link_method,
            ));
            let sources = tmp.path().join("sources");
            std::fs::create_dir_all(&sources).unwrap();
            Self {
                _tmp: tmp,
                pool,
                storage,
                sources,
            }
        }

        async fn import(&self, name: &str, data: &[u8]) -> (String, ChecksumSet) {
            let source = self.sources.join(name);
            fs::write(&source, data).await.unwrap();
            let mut checksums = ChecksumSet::default();
            let path = self
                .pool
                .import(&source, name, &mut checksums, false, &MemoryChecksumCache::new())
                .await
                .unwrap();
            (path, checksums)
        }

        async fn link(&self, pool_path: &str, checksums: &ChecksumSet, force: bool) -> Result<()> {
            self.storage
                .link_from_pool(LinkRequest {
                    published_prefix: "",
                    published_rel_path: "pool/main/h/hello",
                    file_name: "hello.deb",
                    pool: self.pool.as_ref(),
                    pool_path,
                    checksums,
                    force,
                })
                .await
        }

        async fn published(&self) -> Vec<u8> {
            fs::read(self.storage.full_path("pool/main/h/hello/hello.deb"))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_link_is_idempotent() {
        for method in [LinkMethod::Hardlink, LinkMethod::Copy, LinkMethod::Symlink] {
            let fx = Fixture::new(method);
            let (path, checksums) = fx.import("hello.deb", b"content one").await;

            fx.link(&path, &checksums, false).await.unwrap();
            fx.link(&path, &checksums, false).await.unwrap();
            assert_eq!(fx.published().await, b"content one");
        }
    }

    #[tokio::test]
    async fn test_link_conflict_and_force() {
        let fx = Fixture::new(LinkMethod::Copy);
        let (path1, checksums1) = fx.import("one.deb", b"content one").await;
        let (path2, checksums2) = fx.import("two.deb", b"content two").await;

        fx.link(&path1, &checksums1, false).await.unwrap();
        let err = fx.link(&path2, &checksums2, false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { ref path, .. } if path == "pool/main/h/hello/hello.deb"));
        assert_eq!(fx.published().await, b"content one");

        fx.link(&path2, &checksums2, true).await.unwrap();
        assert_eq!(fx.published().await, b"content two");
    }

    #[tokio::test]
    async fn test_link_requires_md5_when_destination_exists() {
        let fx = Fixture::new(LinkMethod::Copy);
        let (path, checksums) = fx.import("hello.deb", b"content").await;
        fx.link(&path, &checksums, false).await.unwrap();

        let without_md5 = ChecksumSet {
            md5: None,
            ..checksums
        };
        let err = fx.link(&path, &without_md5, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hardlink_shares_inode_with_pool() {
        use std::os::unix::fs::MetadataExt;

        let fx = Fixture::new(LinkMethod::Hardlink);
        let (path, checksums) = fx.import("hello.deb", b"content").await;
        fx.link(&path, &checksums, false).await.unwrap();

        let pool_meta = std::fs::metadata(fx.pool.local_path(&path).unwrap()).unwrap();
        let published_meta =
            std::fs::metadata(fx.storage.full_path("pool/main/h/hello/hello.deb")).unwrap();
        assert_eq!(pool_meta.ino(), published_meta.ino());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_identical_links() {
        for method in [LinkMethod::Hardlink, LinkMethod::Copy] {
            let fx = Arc::new(Fixture::new(method));
            let content = vec![0x42u8; 4096];
            let (path, checksums) = fx.import("hello.deb", &content).await;
            let path = Arc::new(path);
            let checksums = Arc::new(checksums);

            let mut handles = Vec::new();
            for _ in 0..5000 {
                let fx = fx.clone();
                let path = path.clone();
                let checksums = checksums.clone();
                handles.push(tokio::spawn(async move {
                    fx.link(&path, &checksums, true).await
                }));
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            assert_eq!(fx.published().await, content);
            assert_eq!(fx.storage.locks.active(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_different_content_single_winner() {
        let fx = Arc::new(Fixture::new(LinkMethod::Copy));
        let one = Arc::new(fx.import("one.deb", b"content one").await);
        let two = Arc::new(fx.import("two.deb", b"content two").await);

        let mut handles = Vec::new();
        for i in 0..200 {
            let fx = fx.clone();
            let candidate = if i % 2 == 0 { one.clone() } else { two.clone() };
            handles.push(tokio::spawn(async move {
                let result = fx.link(&candidate.0, &candidate.1, false).await;
                (candidate.1.md5.clone(), result)
            }));
        }

        let mut winners = std::collections::HashSet::new();
        for handle in handles {
            let (md5, result) = handle.await.unwrap();
            match result {
                Ok(()) => {
                    winners.insert(md5);
                }
                Err(Error::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(winners.len(), 1);
        let published = fx.published().await;
        let winner_md5 = winners.into_iter().next().unwrap();
        assert_eq!(ChecksumSet::compute_bytes(&published).md5, winner_md5);
    }

    #[tokio::test]
    async fn test_filelist() {
        let fx = Fixture::new(LinkMethod::Copy);
        let source = fx.sources.join("file");
        fs::write(&source, b"x").await.unwrap();
        for path in ["a", "b", "c", "test/a", "test/b"] {
            fx.storage.put_file(path, &source).await.unwrap();
        }
        fx.storage.mkdir("empty/dir").await.unwrap();

        assert_eq!(
            fx.storage.filelist("").await.unwrap(),
            vec!["a", "b", "c", "test/a", "test/b"]
        );
        assert_eq!(fx.storage.filelist("test").await.unwrap(), vec!["a", "b"]);
        assert!(fx.storage.filelist("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_rename_remove() {
        let fx = Fixture::new(LinkMethod::Copy);
        let source = fx.sources.join("Release");
        fs::write(&source, b"Origin: test\n").await.unwrap();

        fx.storage.put_file("dists/stable/Release.tmp", &source).await.unwrap();
        fx.storage
            .rename_file("dists/stable/Release.tmp", "dists/stable/Release")
            .await
            .unwrap();
        assert!(!fx.storage.file_exists("dists/stable/Release.tmp").await.unwrap());
        assert!(fx.storage.file_exists("dists/stable/Release").await.unwrap());

        fx.storage.remove("dists/stable/Release").await.unwrap();
        assert!(!fx.storage.file_exists("dists/stable/Release").await.unwrap());
        assert!(matches!(
            fx.storage.remove("dists/stable/Release").await,
            Err(Error::NotFound { .. })
        ));

        fx.storage.put_file("dists/stable/main/Packages", &source).await.unwrap();
        fx.storage.remove_dirs("dists", &NoProgress).await.unwrap();
        fx.storage.remove_dirs("dists", &NoProgress).await.unwrap();
        assert!(fx.storage.filelist("").await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_and_read_link() {
        let fx = Fixture::new(LinkMethod::Copy);
        let source = fx.sources.join("Release");
        fs::write(&source, b"Origin: test\n").await.unwrap();
        fx.storage.put_file("dists/stable/Release", &source).await.unwrap();

        fx.storage.symlink("dists/stable", "dists/current").await.unwrap();
        assert_eq!(fx.storage.read_link("dists/current").await.unwrap(), "dists/stable");

        fx.storage
            .hard_link("dists/stable/Release", "dists/stable/Release.bak")
            .await
            .unwrap();
        assert!(fx.storage.file_exists("dists/stable/Release.bak").await.unwrap());
    }
}
