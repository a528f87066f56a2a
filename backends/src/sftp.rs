//! Published storage on a remote host reached over SFTP.
//!
//! The protocol work sits behind [`SftpSession`]; [`Ssh2Session`] (feature
//! `sftp`) implements it with libssh2.

use crate::locks::KeyedLock;
use crate::object_store::md5_hex;
use crate::storage::{LinkRequest, PublishedStorage, StorageType, read_pool_object};
use async_trait::async_trait;
use bytes::Bytes;
use debpool_core::paths::join_key;
use debpool_core::{Error, ProgressSink, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub kind: RemoteKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub kind: RemoteKind,
}

/// The SFTP operations the storage needs. Paths are absolute remote paths.
#[async_trait]
pub trait SftpSession: Send + Sync {
    /// `Ok(None)` when nothing exists at `path`. Does not follow symlinks.
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>>;
    /// Creates a single directory level.
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn read(&self, path: &str) -> Result<Bytes>;
    async fn write(&self, path: &str, data: Bytes) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;
    /// Fails when `new` exists.
    async fn rename(&self, old: &str, new: &str) -> Result<()>;
    async fn symlink(&self, target: &str, link: &str) -> Result<()>;
    async fn read_link(&self, path: &str) -> Result<String>;
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    /// Remote directory the published tree lives in.
    pub root: String,
}

fn default_port() -> u16 {
    22
}

pub struct SftpPublishedStorage<S: SftpSession> {
    session: Arc<S>,
    root: String,
    locks: KeyedLock,
}

impl<S: SftpSession> SftpPublishedStorage<S> {
    pub fn new(session: Arc<S>, root: impl Into<String>) -> Self {
        Self {
            session,
            root: root.into(),
            locks: KeyedLock::new(),
        }
    }

    fn full_path(&self, path: &str) -> String {
        let rel = join_key(&[path]);
        let root = self.root.trim_end_matches('/');
        let absolute = self.root.starts_with('/');
        match (root.is_empty(), rel.is_empty()) {
            (true, true) if absolute => "/".to_string(),
            (_, true) => root.to_string(),
            (true, false) if !absolute => rel,
            _ => format!("{}/{}", root, rel),
        }
    }

    fn relative(&self, full: &str) -> String {
        let root = self.root.trim_end_matches('/');
        full.strip_prefix(root)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full.to_string())
    }

    async fn mkdir_full(&self, full: &str) -> Result<()> {
        let absolute = full.starts_with('/');
        let mut current = String::new();
        for segment in full.split('/').filter(|s| !s.is_empty()) {
            if absolute || !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            match self.session.stat(&current).await? {
                Some(stat) if stat.kind == RemoteKind::File => {
                    return Err(Error::InvalidInput(format!(
                        "{} exists and is not a directory",
                        current
                    )));
                }
                Some(_) => {}
                None => match self.session.mkdir(&current).await {
                    Ok(()) => {}
                    // created concurrently
                    Err(_) if self.session.stat(&current).await?.is_some() => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    async fn ensure_parent(&self, full: &str) -> Result<()> {
        match full.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => self.mkdir_full(parent).await,
            _ => Ok(()),
        }
    }

    /// Writes next to `full` and moves the result into place.
    async fn write_replacing(&self, full: &str, data: Bytes) -> Result<()> {
        self.ensure_parent(full).await?;
        let tmp = temp_sibling(full);
        self.session.write(&tmp, data).await?;
        self.replace(&tmp, full).await
    }

    /// SFTP rename refuses to overwrite, so the target goes first.
    async fn replace(&self, from: &str, to: &str) -> Result<()> {
        if self.session.stat(to).await?.is_some() {
            self.session.remove(to).await?;
        }
        self.session.rename(from, to).await
    }

    async fn walk(&self, dir: &str, files: &mut Vec<String>, dirs: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir.to_string()];
        while let Some(current) = pending.pop() {
            for entry in self.session.read_dir(&current).await? {
                let path = format!("{}/{}", current.trim_end_matches('/'), entry.name);
                match entry.kind {
                    RemoteKind::Dir => {
                        dirs.push(path.clone());
                        pending.push(path);
                    }
                    RemoteKind::File | RemoteKind::Symlink => files.push(path),
                }
            }
        }
        Ok(())
    }
}

fn temp_sibling(full: &str) -> String {
    let (dir, name) = full.rsplit_once('/').unwrap_or(("", full));
    let tmp = format!(".{}.{:016x}.tmp", name, rand::random::<u64>());
    if dir.is_empty() && !full.starts_with('/') {
        tmp
    } else {
        format!("{}/{}", dir, tmp)
    }
}

#[async_trait]
impl<S: SftpSession + 'static> PublishedStorage for SftpPublishedStorage<S> {
    async fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_full(&self.full_path(path)).await
    }

    async fn put_file(&self, path: &str, source: &Path) -> Result<()> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let _guard = self.locks.lock(path).await;
        self.write_replacing(&self.full_path(path), data).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let _guard = self.locks.lock(path).await;
        let full = self.full_path(path);
        match self.session.stat(&full).await? {
            Some(_) => self.session.remove(&full).await,
            None => Err(Error::not_found(path)),
        }
    }

    async fn remove_dirs(&self, path: &str, progress: &dyn ProgressSink) -> Result<()> {
        let full = self.full_path(path);
        match self.session.stat(&full).await? {
            None => return Ok(()),
            Some(stat) if stat.kind != RemoteKind::Dir => {
                return self.session.remove(&full).await;
            }
            Some(_) => {}
        }

        let (mut files, mut dirs) = (Vec::new(), Vec::new());
        self.walk(&full, &mut files, &mut dirs).await?;
        progress.start(files.len() as u64);
        for file in &files {
            self.session.remove(file).await?;
            progress.advance(1);
        }
        // deepest first
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.matches('/').count()));
        for dir in &dirs {
            self.session.rmdir(dir).await?;
        }
        self.session.rmdir(&full).await?;
        progress.finish();

        info!(path, files = files.len(), "Removed published directory");
        Ok(())
    }

    async fn link_from_pool(&self, request: LinkRequest<'_>) -> Result<()> {
        let path = request.destination();
        let full = self.full_path(&path);
        let _guard = self.locks.lock(&path).await;

        if self.session.stat(&full).await?.is_some() {
            let source_md5 = request.checksums.md5.as_deref().ok_or_else(|| {
                Error::InvalidInput(format!(
                    "cannot compare {} with existing file, MD5 checksum missing",
                    path
                ))
            })?;
            let existing = md5_hex(&self.session.read(&full).await?);
            if existing.eq_ignore_ascii_case(source_md5) {
                debug!(path = %path, "Destination already holds identical content");
                return Ok(());
            }
            if !request.force {
                return Err(Error::conflict(
                    &path,
                    format!(
                        "file already exists and is different (existing MD5 {}, new MD5 {})",
                        existing, source_md5
                    ),
                ));
            }
            info!(path = %path, "Overwriting destination with different content");
        }

        let data = read_pool_object(request.pool, request.pool_path).await?;
        self.write_replacing(&full, data).await?;
        debug!(path = %path, pool_path = request.pool_path, "Linked pool object");
        Ok(())
    }

    async fn filelist(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.full_path(prefix);
        match self.session.stat(&base).await? {
            Some(stat) if stat.kind == RemoteKind::Dir => {}
            _ => return Ok(Vec::new()),
        }

        let (mut files, mut dirs) = (Vec::new(), Vec::new());
        self.walk(&base, &mut files, &mut dirs).await?;
        let base_prefix = format!("{}/", base.trim_end_matches('/'));
        let mut files: Vec<String> = files
            .into_iter()
            .filter_map(|file| file.strip_prefix(&base_prefix).map(str::to_string))
            .collect();
        files.sort();
        Ok(files)
    }

    async fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let _guard = self.locks.lock(new).await;
        let (from, to) = (self.full_path(old), self.full_path(new));
        if self.session.stat(&from).await?.is_none() {
            return Err(Error::not_found(old));
        }
        self.ensure_parent(&to).await?;
        self.replace(&from, &to).await
    }

    async fn symlink(&self, src: &str, dst: &str) -> Result<()> {
        let _guard = self.locks.lock(dst).await;
        let link = self.full_path(dst);
        self.ensure_parent(&link).await?;
        if self.session.stat(&link).await?.is_some() {
            self.session.remove(&link).await?;
        }
        self.session.symlink(&self.full_path(src), &link).await
    }

    async fn hard_link(&self, src: &str, dst: &str) -> Result<()> {
        let data = self.session.read(&self.full_path(src)).await?;
        let _guard = self.locks.lock(dst).await;
        self.write_replacing(&self.full_path(dst), data).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.session.stat(&self.full_path(path)).await?.is_some())
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let target = self.session.read_link(&self.full_path(path)).await?;
        Ok(self.relative(&target))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Sftp
    }
}

#[cfg(feature = "sftp")]
pub use self::ssh::Ssh2Session;

/// Orders arguments for `ssh2::Sftp::symlink(path, target)`, which creates
/// the link at `target` pointing at `path`.
#[cfg(any(feature = "sftp", test))]
fn ssh2_symlink_args<'a>(target: &'a Path, link: &'a Path) -> (&'a Path, &'a Path) {
    (target, link)
}

#[cfg(feature = "sftp")]
mod ssh {
    use super::*;
    use ssh2::{ErrorCode, FileStat, FileType, Sftp};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Mutex;

    // LIBSSH2_FX_NO_SUCH_FILE
    const FX_NO_SUCH_FILE: i32 = 2;

    /// libssh2 session. Calls block, so each runs on the blocking pool.
    pub struct Ssh2Session {
        _session: Mutex<ssh2::Session>,
        sftp: Arc<Mutex<Sftp>>,
    }

    impl Ssh2Session {
        pub async fn connect(config: &SftpConfig) -> Result<Self> {
            let config = config.clone();
            tokio::task::spawn_blocking(move || Self::connect_blocking(&config)).await?
        }

        fn connect_blocking(config: &SftpConfig) -> Result<Self> {
            let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
            let mut session = ssh2::Session::new().map_err(ssh_error)?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(ssh_error)?;

            match (&config.private_key, &config.password) {
                (Some(key), password) => session
                    .userauth_pubkey_file(&config.username, None, key, password.as_deref())
                    .map_err(ssh_error)?,
                (None, Some(password)) => session
                    .userauth_password(&config.username, password)
                    .map_err(ssh_error)?,
                (None, None) => session.userauth_agent(&config.username).map_err(ssh_error)?,
            }
            if !session.authenticated() {
                return Err(Error::Backend(format!(
                    "SFTP authentication failed for {}@{}",
                    config.username, config.host
                )));
            }

            let sftp = session.sftp().map_err(ssh_error)?;
            info!(host = %config.host, "Connected to SFTP server");
            Ok(Self {
                _session: Mutex::new(session),
                sftp: Arc::new(Mutex::new(sftp)),
            })
        }

        async fn run<T, F>(&self, path: &str, op: F) -> Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&Sftp, &Path) -> std::result::Result<T, ssh2::Error> + Send + 'static,
        {
            let sftp = self.sftp.clone();
            let owned = PathBuf::from(path);
            let result = tokio::task::spawn_blocking(move || {
                let sftp = sftp.lock().unwrap_or_else(|e| e.into_inner());
                op(&sftp, &owned)
            })
            .await?;
            result.map_err(|e| {
                if matches!(e.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE)) {
                    Error::not_found(path)
                } else {
                    ssh_error(e)
                }
            })
        }
    }

    fn ssh_error(e: ssh2::Error) -> Error {
        Error::Backend(format!("SFTP error: {}", e))
    }

    fn kind(stat: &FileStat) -> RemoteKind {
        match stat.file_type() {
            FileType::Directory => RemoteKind::Dir,
            FileType::Symlink => RemoteKind::Symlink,
            _ => RemoteKind::File,
        }
    }

    #[async_trait]
    impl SftpSession for Ssh2Session {
        async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
            match self.run(path, |sftp, p| sftp.lstat(p)).await {
                Ok(stat) => Ok(Some(RemoteStat {
                    size: stat.size.unwrap_or(0),
                    kind: kind(&stat),
                })),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        }

        async fn mkdir(&self, path: &str) -> Result<()> {
            self.run(path, |sftp, p| sftp.mkdir(p, 0o755)).await
        }

        async fn read(&self, path: &str) -> Result<Bytes> {
            let sftp = self.sftp.clone();
            let owned = PathBuf::from(path);
            let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                let sftp = sftp.lock().unwrap_or_else(|e| e.into_inner());
                let mut file = sftp.open(&owned).map_err(ssh_error)?;
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            })
            .await??;
            Ok(data.into())
        }

        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            let sftp = self.sftp.clone();
            let owned = PathBuf::from(path);
            tokio::task::spawn_blocking(move || -> Result<()> {
                let sftp = sftp.lock().unwrap_or_else(|e| e.into_inner());
                let mut file = sftp.create(&owned).map_err(ssh_error)?;
                file.write_all(&data)?;
                Ok(())
            })
            .await?
        }

        async fn remove(&self, path: &str) -> Result<()> {
            self.run(path, |sftp, p| sftp.unlink(p)).await
        }

        async fn rmdir(&self, path: &str) -> Result<()> {
            self.run(path, |sftp, p| sftp.rmdir(p)).await
        }

        async fn rename(&self, old: &str, new: &str) -> Result<()> {
            let new = PathBuf::from(new);
            self.run(old, move |sftp, p| sftp.rename(p, &new, None)).await
        }

        async fn symlink(&self, target: &str, link: &str) -> Result<()> {
            let target = PathBuf::from(target);
            self.run(link, move |sftp, p| {
                let (path, at) = ssh2_symlink_args(&target, p);
                sftp.symlink(path, at)
            })
            .await
        }

        async fn read_link(&self, path: &str) -> Result<String> {
            let target = self.run(path, |sftp, p| sftp.readlink(p)).await?;
            Ok(target.to_string_lossy().into_owned())
        }

        async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
            let entries = self.run(path, |sftp, p| sftp.readdir(p)).await?;
            Ok(entries
                .into_iter()
                .filter_map(|(entry, stat)| {
                    let name = entry.file_name()?.to_string_lossy().into_owned();
                    (name != "." && name != "..").then(|| RemoteDirEntry {
                        name,
                        kind: kind(&stat),
                    })
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debpool_core::{ChecksumSet, LocalPool, MemoryChecksumCache, NoProgress, PackagePool};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    enum Node {
        File(Bytes),
        Dir,
        Symlink(String),
    }

    /// Remote filesystem held in memory, with SFTP's refusing rename.
    #[derive(Default)]
    struct MemorySftp {
        nodes: Mutex<BTreeMap<String, Node>>,
        mkdirs: AtomicUsize,
        writes: AtomicUsize,
    }

    impl MemorySftp {
        fn new() -> Self {
            let session = Self::default();
            session.nodes.lock().unwrap().insert("/srv".to_string(), Node::Dir);
            session
        }

        fn file(&self, path: &str) -> Option<Bytes> {
            match self.nodes.lock().unwrap().get(path) {
                Some(Node::File(data)) => Some(data.clone()),
                _ => None,
            }
        }

        fn require_parent(nodes: &BTreeMap<String, Node>, path: &str) -> Result<()> {
            match path.rsplit_once('/') {
                Some((parent, _)) if !parent.is_empty() => match nodes.get(parent) {
                    Some(Node::Dir) => Ok(()),
                    _ => Err(Error::not_found(parent)),
                },
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl SftpSession for MemorySftp {
        async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
            Ok(self.nodes.lock().unwrap().get(path).map(|node| match node {
                Node::File(data) => RemoteStat {
                    size: data.len() as u64,
                    kind: RemoteKind::File,
                },
                Node::Dir => RemoteStat {
                    size: 0,
                    kind: RemoteKind::Dir,
                },
                Node::Symlink(_) => RemoteStat {
                    size: 0,
                    kind: RemoteKind::Symlink,
                },
            }))
        }

        async fn mkdir(&self, path: &str) -> Result<()> {
            self.mkdirs.fetch_add(1, Ordering::SeqCst);
            let mut nodes = self.nodes.lock().unwrap();
            Self::require_parent(&nodes, path)?;
            if nodes.contains_key(path) {
                return Err(Error::Backend(format!("{} exists", path)));
            }
            nodes.insert(path.to_string(), Node::Dir);
            Ok(())
        }

        async fn read(&self, path: &str) -> Result<Bytes> {
            let nodes = self.nodes.lock().unwrap();
            let mut current = path.to_string();
            loop {
                match nodes.get(&current) {
                    Some(Node::File(data)) => return Ok(data.clone()),
                    Some(Node::Symlink(target)) => current = target.clone(),
                    _ => return Err(Error::not_found(path)),
                }
            }
        }

        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut nodes = self.nodes.lock().unwrap();
            Self::require_parent(&nodes, path)?;
            nodes.insert(path.to_string(), Node::File(data));
            Ok(())
        }

        async fn remove(&self, path: &str) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get(path) {
                Some(Node::Dir) | None => Err(Error::not_found(path)),
                Some(_) => {
                    nodes.remove(path);
                    Ok(())
                }
            }
        }

        async fn rmdir(&self, path: &str) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let child = format!("{}/", path);
            if nodes.keys().any(|key| key.starts_with(&child)) {
                return Err(Error::Backend(format!("{} not empty", path)));
            }
            nodes.remove(path);
            Ok(())
        }

        async fn rename(&self, old: &str, new: &str) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(new) {
                return Err(Error::Backend(format!("{} exists", new)));
            }
            let node = nodes.remove(old).ok_or_else(|| Error::not_found(old))?;
            nodes.insert(new.to_string(), node);
            Ok(())
        }

        async fn symlink(&self, target: &str, link: &str) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            Self::require_parent(&nodes, link)?;
            nodes.insert(link.to_string(), Node::Symlink(target.to_string()));
            Ok(())
        }

        async fn read_link(&self, path: &str) -> Result<String> {
            match self.nodes.lock().unwrap().get(path) {
                Some(Node::Symlink(target)) => Ok(target.clone()),
                _ => Err(Error::InvalidInput(format!("{} is not a symlink", path))),
            }
        }

        async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
            let nodes = self.nodes.lock().unwrap();
            let prefix = format!("{}/", path);
            Ok(nodes
                .iter()
                .filter_map(|(key, node)| {
                    let name = key.strip_prefix(&prefix)?;
                    (!name.contains('/')).then(|| RemoteDirEntry {
                        name: name.to_string(),
                        kind: match node {
                            Node::File(_) => RemoteKind::File,
                            Node::Dir => RemoteKind::Dir,
                            Node::Symlink(_) => RemoteKind::Symlink,
                        },
                    })
                })
                .collect())
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        pool: LocalPool,
        session: Arc<MemorySftp>,
        storage: SftpPublishedStorage<MemorySftp>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let session = Arc::new(MemorySftp::new());
            Self {
                pool: LocalPool::new(tmp.path().join("pool")),
                storage: SftpPublishedStorage::new(session.clone(), "/srv/repo"),
                session,
                tmp,
            }
        }

        async fn import(&self, name: &str, data: &[u8]) -> (String, ChecksumSet) {
            let source = self.tmp.path().join(name);
            tokio::fs::write(&source, data).await.unwrap();
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
                    pool: &self.pool,
                    pool_path,
                    checksums,
                    force,
                })
                .await
        }
    }

    const DEST: &str = "/srv/repo/pool/main/h/hello/hello.deb";

    #[tokio::test]
    async fn test_mkdir_walks_segments() {
        let fx = Fixture::new();
        fx.storage.mkdir("dists/stable/main").await.unwrap();
        fx.storage.mkdir("dists/stable/main").await.unwrap();

        // /srv exists; repo, dists, stable and main are created once
        assert_eq!(fx.session.mkdirs.load(Ordering::SeqCst), 4);
        assert!(fx.storage.file_exists("dists/stable/main").await.unwrap());
    }

    #[tokio::test]
    async fn test_link_conflict_and_force() {
        let fx = Fixture::new();
        let (path1, checksums1) = fx.import("one.deb", b"content one").await;
        let (path2, checksums2) = fx.import("two.deb", b"content two").await;

        fx.link(&path1, &checksums1, false).await.unwrap();
        fx.link(&path1, &checksums1, false).await.unwrap();
        assert_eq!(fx.session.writes.load(Ordering::SeqCst), 1);

        let err = fx.link(&path2, &checksums2, false).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(fx.session.file(DEST).unwrap(), Bytes::from_static(b"content one"));

        fx.link(&path2, &checksums2, true).await.unwrap();
        assert_eq!(fx.session.file(DEST).unwrap(), Bytes::from_static(b"content two"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_links() {
        let fx = Arc::new(Fixture::new());
        let (path, checksums) = fx.import("hello.deb", b"shared").await;

        let mut handles = Vec::new();
        for _ in 0..500 {
            let fx = fx.clone();
            let path = path.clone();
            let checksums = checksums.clone();
            handles.push(tokio::spawn(async move {
                fx.link(&path, &checksums, false).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(fx.session.writes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.session.file(DEST).unwrap(), Bytes::from_static(b"shared"));
    }

    #[tokio::test]
    async fn test_filelist_and_remove_dirs() {
        let fx = Fixture::new();
        let source = fx.tmp.path().join("seed");
        tokio::fs::write(&source, b"x").await.unwrap();
        for path in ["a", "b", "c", "test/a", "test/b"] {
            fx.storage.put_file(&format!("lala/{}", path), &source).await.unwrap();
        }

        assert_eq!(
            fx.storage.filelist("lala").await.unwrap(),
            vec!["a", "b", "c", "test/a", "test/b"]
        );
        assert!(fx.storage.filelist("missing").await.unwrap().is_empty());

        fx.storage.remove_dirs("lala", &NoProgress).await.unwrap();
        assert!(!fx.storage.file_exists("lala").await.unwrap());
        fx.storage.remove_dirs("lala", &NoProgress).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_replaces_existing() {
        let fx = Fixture::new();
        let source = fx.tmp.path().join("release");
        tokio::fs::write(&source, b"new").await.unwrap();
        fx.storage.put_file("dists/stable/Release.tmp", &source).await.unwrap();
        tokio::fs::write(&source, b"old").await.unwrap();
        fx.storage.put_file("dists/stable/Release", &source).await.unwrap();

        fx.storage
            .rename_file("dists/stable/Release.tmp", "dists/stable/Release")
            .await
            .unwrap();
        assert_eq!(
            fx.session.file("/srv/repo/dists/stable/Release").unwrap(),
            Bytes::from_static(b"new")
        );
        assert!(!fx.storage.file_exists("dists/stable/Release.tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_symlink_and_read_link() {
        let fx = Fixture::new();
        let source = fx.tmp.path().join("release");
        tokio::fs::write(&source, b"Origin: test").await.unwrap();
        fx.storage.put_file("dists/stable/Release", &source).await.unwrap();

        fx.storage.symlink("dists/stable", "dists/current").await.unwrap();
        assert_eq!(fx.storage.read_link("dists/current").await.unwrap(), "dists/stable");

        fx.storage
            .hard_link("dists/stable/Release", "dists/copy/Release")
            .await
            .unwrap();
        assert_eq!(
            fx.session.file("/srv/repo/dists/copy/Release").unwrap(),
            Bytes::from_static(b"Origin: test")
        );
    }

    #[test]
    fn test_full_path() {
        let storage = SftpPublishedStorage::new(Arc::new(MemorySftp::new()), "/srv/repo/");
        assert_eq!(storage.full_path("pool/a.deb"), "/srv/repo/pool/a.deb");
        assert_eq!(storage.full_path(""), "/srv/repo");

        let storage = SftpPublishedStorage::new(Arc::new(MemorySftp::new()), "");
        assert_eq!(storage.full_path("/pool/a.deb"), "pool/a.deb");
    }

    #[test]
    fn test_ssh2_symlink_argument_order() {
        let target = Path::new("/srv/repo/dists/stable");
        let link = Path::new("/srv/repo/dists/current");
        let (path, at) = ssh2_symlink_args(target, link);
        assert_eq!(path, target);
        assert_eq!(at, link);
    }
}
