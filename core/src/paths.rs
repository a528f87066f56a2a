use crate::{Error, Result};

/// Number of hex characters of the selected hash that make up a pool path.
pub const POOL_HASH_LEN: usize = 32;

/// Pool location for content with digest `hash`:
/// `<hash[0..2]>/<hash[2..4]>/<hash[4..32]>_<basename>`.
pub fn pool_path(hash: &str, basename: &str) -> Result<String> {
    if hash.len() < POOL_HASH_LEN || !hash.is_ascii() {
        return Err(Error::InvalidInput(format!(
            "hash {:?} is too short to derive a pool path",
            hash
        )));
    }
    if basename.is_empty() || basename.contains('/') {
        return Err(Error::InvalidInput(format!(
            "invalid package file name {:?}",
            basename
        )));
    }
    let hash = hash.to_ascii_lowercase();
    Ok(format!(
        "{}/{}/{}_{}",
        &hash[0..2],
        &hash[2..4],
        &hash[4..POOL_HASH_LEN],
        basename
    ))
}

/// Joins path segments with `/`, skipping empty ones and collapsing the
/// slashes at the seams.
pub fn join_key<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| p.as_ref().trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Directory a source package's files are published under:
/// `pool/<component>/<group>/<source>`, where the group is `libX` for
/// library packages and the first character otherwise.
pub fn published_pool_dir(component: &str, source: &str) -> Result<String> {
    if source.is_empty() {
        return Err(Error::InvalidInput("empty source package name".to_string()));
    }
    let group = if source.starts_with("lib") && source.len() > 3 {
        source.chars().take(4).collect::<String>()
    } else {
        source.chars().take(1).collect::<String>()
    };
    Ok(join_key(&["pool", component, &group, source]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_path_from_fixture_hash() {
        let sha256 = "c76b4bd12fd92e4dfe1b55b18a67a669d92f62985d6a96c8a21d96120982cf12";
        assert_eq!(
            pool_path(sha256, "some.deb").unwrap(),
            "c7/6b/4bd12fd92e4dfe1b55b18a67a669_some.deb"
        );
    }

    #[test]
    fn test_pool_path_rejects_short_hash() {
        assert!(pool_path("abcd", "a.deb").is_err());
        assert!(pool_path(&"0".repeat(32), "").is_err());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(&["", "pool/", "/main", "a.deb"]), "pool/main/a.deb");
        assert_eq!(join_key::<&str>(&[]), "");
    }

    #[test]
    fn test_published_pool_dir() {
        assert_eq!(published_pool_dir("main", "libc6").unwrap(), "pool/main/libc/libc6");
        assert_eq!(published_pool_dir("contrib", "nginx").unwrap(), "pool/contrib/n/nginx");
        assert_eq!(published_pool_dir("main", "lib").unwrap(), "pool/main/l/lib");
    }
}
