//! Package checksums.
//!
//! A [`ChecksumSet`] carries the size and the four digests Debian index files
//! publish for every package. Fields the caller does not know yet are `None`;
//! the pool fills them in as it learns them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSet {
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
}

impl ChecksumSet {
    /// Hashes everything `reader` yields in a single pass.
    pub fn compute<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut md5 = md5::Context::new();
        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut sha512 = Sha512::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let chunk = &buf[..n];
            md5.consume(chunk);
            sha1.update(chunk);
            sha256.update(chunk);
            sha512.update(chunk);
            size += n as u64;
        }

        Ok(Self {
            size,
            md5: Some(format!("{:x}", md5.compute())),
            sha1: Some(hex::encode(sha1.finalize())),
            sha256: Some(hex::encode(sha256.finalize())),
            sha512: Some(hex::encode(sha512.finalize())),
        })
    }

    pub fn compute_bytes(data: &[u8]) -> Self {
        // Reading from a slice cannot fail.
        Self::compute(data).unwrap_or_default()
    }

    /// Hashes a file on a blocking thread.
    pub async fn for_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let checksums = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            ChecksumSet::compute(std::io::BufReader::new(file))
        })
        .await??;
        Ok(checksums)
    }

    pub fn is_complete(&self) -> bool {
        self.md5.is_some() && self.sha1.is_some() && self.sha256.is_some() && self.sha512.is_some()
    }

    pub fn get(&self, selector: HashSelector) -> Option<&str> {
        match selector {
            HashSelector::Md5 => self.md5.as_deref(),
            HashSelector::Sha1 => self.sha1.as_deref(),
            HashSelector::Sha256 => self.sha256.as_deref(),
            HashSelector::Sha512 => self.sha512.as_deref(),
        }
    }

    /// Fills every field that is missing here from `other`.
    pub fn backfill(&mut self, other: &ChecksumSet) {
        if self.size == 0 {
            self.size = other.size;
        }
        fill(&mut self.md5, &other.md5);
        fill(&mut self.sha1, &other.sha1);
        fill(&mut self.sha256, &other.sha256);
        fill(&mut self.sha512, &other.sha512);
    }

    /// Returns the first field supplied here whose value disagrees with
    /// `actual`, as `(field, expected, actual)`. Size is not compared.
    pub fn first_mismatch(&self, actual: &ChecksumSet) -> Option<(&'static str, String, String)> {
        let pairs = [
            ("MD5", &self.md5, &actual.md5),
            ("SHA1", &self.sha1, &actual.sha1),
            ("SHA256", &self.sha256, &actual.sha256),
            ("SHA512", &self.sha512, &actual.sha512),
        ];
        for (field, expected, found) in pairs {
            if let (Some(expected), Some(found)) = (expected, found) {
                if !expected.eq_ignore_ascii_case(found) {
                    return Some((field, expected.clone(), found.clone()));
                }
            }
        }
        None
    }

    /// Like [`first_mismatch`](Self::first_mismatch) but as an error.
    pub fn check_against(&self, path: &str, actual: &ChecksumSet) -> Result<()> {
        if self.size != 0 && self.size != actual.size {
            return Err(Error::ChecksumMismatch {
                path: path.to_string(),
                field: "size",
                expected: self.size.to_string(),
                actual: actual.size.to_string(),
            });
        }
        match self.first_mismatch(actual) {
            Some((field, expected, actual)) => Err(Error::ChecksumMismatch {
                path: path.to_string(),
                field,
                expected,
                actual,
            }),
            None => Ok(()),
        }
    }
}

fn fill(slot: &mut Option<String>, from: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(from);
    }
}

/// Which digest names objects in a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashSelector {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

impl HashSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashSelector::Md5 => "md5",
            HashSelector::Sha1 => "sha1",
            HashSelector::Sha256 => "sha256",
            HashSelector::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashSelector::Md5),
            "sha1" => Ok(HashSelector::Sha1),
            "sha256" => Ok(HashSelector::Sha256),
            "sha512" => Ok(HashSelector::Sha512),
            other => Err(Error::InvalidInput(format!("unknown hash selector: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_known_digests() {
        let checksums = ChecksumSet::compute_bytes(b"hello");

        assert_eq!(checksums.size, 5);
        assert_eq!(checksums.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert_eq!(
            checksums.sha1.as_deref(),
            Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
        assert_eq!(
            checksums.sha256.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert!(checksums.is_complete());
    }

    #[test]
    fn test_same_bytes_same_set() {
        let data = vec![7u8; 200_000];
        assert_eq!(ChecksumSet::compute_bytes(&data), ChecksumSet::compute(&data[..]).unwrap());
    }

    #[test]
    fn test_backfill_keeps_known_fields() {
        let mut partial = ChecksumSet {
            size: 5,
            md5: Some("supplied".to_string()),
            ..Default::default()
        };
        partial.backfill(&ChecksumSet::compute_bytes(b"hello"));

        assert_eq!(partial.md5.as_deref(), Some("supplied"));
        assert!(partial.is_complete());
    }

    #[test]
    fn test_mismatch_only_on_supplied_fields() {
        let actual = ChecksumSet::compute_bytes(b"hello");
        let expected = ChecksumSet {
            size: 5,
            sha1: actual.sha1.clone(),
            ..Default::default()
        };
        assert!(expected.first_mismatch(&actual).is_none());

        let wrong = ChecksumSet {
            size: 5,
            sha256: Some("00".repeat(32)),
            ..Default::default()
        };
        let (field, _, _) = wrong.first_mismatch(&actual).unwrap();
        assert_eq!(field, "SHA256");
        assert!(matches!(
            wrong.check_against("x", &actual),
            Err(Error::ChecksumMismatch { field: "SHA256", .. })
        ));
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("SHA512".parse::<HashSelector>().unwrap(), HashSelector::Sha512);
        assert_eq!(HashSelector::default(), HashSelector::Sha256);
        assert!("crc32".parse::<HashSelector>().is_err());
    }
}
