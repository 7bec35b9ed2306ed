//! Deterministic bucket assignment for canonical domain names.
//!
//! A domain's bucket is the first eight bytes of `SHA-256(domain)` read as a
//! little-endian `u64`, modulo the bucket count. The hash is unsigned, so no
//! sign correction is needed, and it is stable across processes and
//! platforms. The sharder and the reducer must be run with the same
//! [`BucketCount`]; nothing in the files records it.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// File name prefix for bucket files.
pub const BUCKET_FILE_PREFIX: &str = "bucket_";

/// File name suffix for bucket files.
pub const BUCKET_FILE_SUFFIX: &str = ".csv";

/// Number of buckets the domain namespace is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCount(u32);

impl BucketCount {
    /// Create a bucket count, rejecting zero.
    pub fn new(count: u32) -> Result<Self> {
        if count == 0 {
            return Err(Error::ZeroBuckets);
        }
        Ok(Self(count))
    }

    /// The number of buckets.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whether `bucket` is a valid id for this count.
    pub fn contains(self, bucket: BucketId) -> bool {
        bucket.0 < self.0
    }
}

impl Default for BucketCount {
    fn default() -> Self {
        Self(crate::DEFAULT_BUCKET_COUNT)
    }
}

/// Identifier of one bucket, in `[0, K)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub u32);

impl BucketId {
    /// Path of this bucket's file inside `dir`.
    pub fn file_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{BUCKET_FILE_PREFIX}{}{BUCKET_FILE_SUFFIX}", self.0))
    }

    /// Parse a bucket id back out of a `bucket_<id>.csv` file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix(BUCKET_FILE_PREFIX)?
            .strip_suffix(BUCKET_FILE_SUFFIX)?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assign a canonical domain to its bucket.
pub fn bucket_for(domain: &str, buckets: BucketCount) -> BucketId {
    let digest = Sha256::digest(domain.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_le_bytes(prefix);
    BucketId((hash % u64::from(buckets.get())) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn k(n: u32) -> BucketCount {
        BucketCount::new(n).unwrap()
    }

    #[test]
    fn test_zero_buckets_rejected() {
        assert!(matches!(BucketCount::new(0), Err(Error::ZeroBuckets)));
    }

    #[test]
    fn test_known_vectors() {
        // SHA-256("abc") starts with 0xba, SHA-256("") with 0xe3; with a power
        // of two bucket count only the low bits of the first byte matter.
        assert_eq!(bucket_for("abc", k(256)), BucketId(0xba));
        assert_eq!(bucket_for("abc", k(128)), BucketId(0xba & 0x7f));
        assert_eq!(bucket_for("", k(128)), BucketId(0xe3 & 0x7f));
    }

    #[test]
    fn test_deterministic() {
        for domain in ["example.com", "*.example.com", "bücher.de"] {
            assert_eq!(bucket_for(domain, k(128)), bucket_for(domain, k(128)));
        }
    }

    #[test]
    fn test_in_range() {
        for n in [1, 2, 7, 128, 1000] {
            for i in 0..500 {
                let id = bucket_for(&format!("host{i}.example.com"), k(n));
                assert!(k(n).contains(id), "bucket {id} out of range for {n}");
            }
        }
    }

    #[test]
    fn test_single_bucket() {
        assert_eq!(bucket_for("anything.org", k(1)), BucketId(0));
    }

    #[test]
    fn test_spreads_across_buckets() {
        let used: HashSet<_> = (0..5000)
            .map(|i| bucket_for(&format!("d{i}.net"), k(16)))
            .collect();
        assert_eq!(used.len(), 16);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let dir = Path::new("/tmp/buckets");
        let path = BucketId(42).file_path(dir);
        assert_eq!(path, Path::new("/tmp/buckets/bucket_42.csv"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(BucketId::from_file_name(name), Some(BucketId(42)));
    }

    #[test]
    fn test_from_file_name_rejects_other_files() {
        assert_eq!(BucketId::from_file_name("output_0.csv"), None);
        assert_eq!(BucketId::from_file_name("bucket_x.csv"), None);
        assert_eq!(BucketId::from_file_name("bucket_1.csv.gz"), None);
        assert_eq!(BucketId::from_file_name("error_log.txt"), None);
    }
}
