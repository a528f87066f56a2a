pub mod import;
pub mod link;
pub mod list;
pub mod remove_dirs;
pub mod verify;

use std::path::Path;

use anyhow::{Result, anyhow};

/// File name a package is stored and published under.
pub(crate) fn basename(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))
}
