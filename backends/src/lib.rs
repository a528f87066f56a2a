pub mod azure;
pub mod local;
pub mod locks;
pub mod memory;
pub mod object_store;
pub mod path_cache;
pub mod remote;
pub mod remote_pool;
pub mod retry;
pub mod s3;
pub mod sftp;
pub mod storage;
pub mod swift;

pub use azure::{AzureAuthMethod, AzureConfig, AzureStore};
pub use local::{LinkMethod, LocalPublishedStorage};
pub use memory::MemoryStore;
pub use object_store::{ListPage, Lease, Metadata, ObjectEntry, ObjectMeta, ObjectStore};
pub use remote::{RemoteConfig, RemotePublishedStorage};
pub use remote_pool::RemotePool;
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
pub use s3::{S3Config, S3Store};
pub use sftp::{SftpConfig, SftpPublishedStorage, SftpSession};
#[cfg(feature = "sftp")]
pub use sftp::Ssh2Session;
pub use storage::{LinkRequest, PublishedStorage, StorageType};
pub use swift::{SwiftConfig, SwiftStore};
