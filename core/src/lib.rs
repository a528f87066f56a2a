pub mod cache;
pub mod checksum;
pub mod error;
pub mod paths;
pub mod pool;
pub mod progress;

pub use cache::{ChecksumCache, FileChecksumCache, MemoryChecksumCache};
pub use checksum::{ChecksumSet, HashSelector};
pub use error::{Error, Result};
pub use pool::{LocalPool, PackagePool, PoolFile, PoolReader, SelectorCell};
pub use progress::{NoProgress, ProgressSink};
