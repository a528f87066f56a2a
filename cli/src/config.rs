use anyhow::{Context, Result, anyhow};
use debpool_backends::{
    AzureConfig, AzureStore, LinkMethod, LocalPublishedStorage, PublishedStorage, RemoteConfig,
    RemotePublishedStorage, RetryConfig, S3Config, S3Store, SftpConfig, SwiftConfig, SwiftStore,
};
use debpool_core::{
    ChecksumCache, FileChecksumCache, HashSelector, LocalPool, MemoryChecksumCache,
};
use directories::ProjectDirs;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub defaults: Defaults,
    pub storages: BTreeMap<String, StorageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub root: PathBuf,
    pub hash: HashSelector,
    /// JSON file the checksum cache persists to; in-memory when unset.
    pub checksum_cache: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub force: bool,
    pub skip_cleanup: bool,
    pub delete_batch_size: usize,
    pub listing_depth: usize,
    pub listing_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        root: PathBuf,
        #[serde(default)]
        link_method: LinkMethod,
    },
    S3 {
        #[serde(default)]
        prefix: String,
        #[serde(flatten)]
        s3: S3Config,
    },
    Azure {
        #[serde(default)]
        prefix: String,
        #[serde(flatten)]
        azure: AzureConfig,
    },
    Swift {
        #[serde(default)]
        prefix: String,
        #[serde(flatten)]
        swift: SwiftConfig,
    },
    Sftp(SftpConfig),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "debpool", "debpool")
}

impl Default for PoolConfig {
    fn default() -> Self {
        let root = project_dirs()
            .map(|dirs| dirs.data_dir().join("pool"))
            .unwrap_or_else(|| PathBuf::from("pool"));
        Self {
            root,
            hash: HashSelector::default(),
            checksum_cache: None,
        }
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            force: false,
            skip_cleanup: false,
            delete_batch_size: 1000,
            listing_depth: 0,
            listing_concurrency: 16,
        }
    }
}

impl Config {
    /// Reads `path`, or the per-user default location when `None`. A missing
    /// default file yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match project_dirs() {
                Some(dirs) => (dirs.config_dir().join("config.toml"), false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("Invalid configuration in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Cannot read {}", path.display())),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn open_pool(&self) -> LocalPool {
        LocalPool::with_hash_selector(&self.pool.root, self.pool.hash)
    }

    pub async fn open_checksum_cache(&self) -> Result<Box<dyn ChecksumCache>> {
        Ok(match &self.pool.checksum_cache {
            Some(path) => Box::new(FileChecksumCache::open(path).await?),
            None => Box::new(MemoryChecksumCache::new()),
        })
    }

    fn remote_config(&self, prefix: &str) -> RemoteConfig {
        RemoteConfig {
            prefix: prefix.to_string(),
            retry: RetryConfig::persistent(),
            delete_batch_size: self.defaults.delete_batch_size,
            listing_depth: self.defaults.listing_depth,
            listing_concurrency: self.defaults.listing_concurrency,
        }
    }

    pub async fn open_storage(&self, name: &str) -> Result<Arc<dyn PublishedStorage>> {
        let storage = self.storages.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown storage {:?}; configured: {}",
                name,
                self.storages.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })?;

        let opened: Arc<dyn PublishedStorage> = match storage {
            StorageConfig::Local { root, link_method } => Arc::new(
                LocalPublishedStorage::with_link_method(root, *link_method),
            ),
            StorageConfig::S3 { prefix, s3 } => Arc::new(RemotePublishedStorage::new(
                Arc::new(S3Store::new(s3.clone()).await?),
                self.remote_config(prefix),
            )),
            StorageConfig::Azure { prefix, azure } => Arc::new(RemotePublishedStorage::new(
                Arc::new(AzureStore::new(azure.clone()).await?),
                self.remote_config(prefix),
            )),
            StorageConfig::Swift { prefix, swift } => Arc::new(RemotePublishedStorage::new(
                Arc::new(SwiftStore::new(swift.clone())?),
                self.remote_config(prefix),
            )),
            StorageConfig::Sftp(sftp) => open_sftp(sftp).await?,
        };
        info!(storage = name, backend = %opened.storage_type(), "Opened published storage");
        Ok(opened)
    }
}

#[cfg(feature = "sftp")]
async fn open_sftp(config: &SftpConfig) -> Result<Arc<dyn PublishedStorage>> {
    use debpool_backends::{SftpPublishedStorage, Ssh2Session};

    let session = Ssh2Session::connect(config).await?;
    Ok(Arc::new(SftpPublishedStorage::new(
        Arc::new(session),
        config.root.clone(),
    )))
}

#[cfg(not(feature = "sftp"))]
async fn open_sftp(config: &SftpConfig) -> Result<Arc<dyn PublishedStorage>> {
    anyhow::bail!(
        "storage on {} needs SFTP support; rebuild with --features sftp",
        config.host
    )
}
