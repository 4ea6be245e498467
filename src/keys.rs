//! Cache key derivation.
//!
//! A URL maps to a `(provider_key, file_key)` pair: everything between the
//! scheme and the last path segment identifies the provider, the last path
//! segment the file. Both halves are hashed with a weighted byte sum over an
//! MD5 digest. This is a bucketing hash with an accepted collision risk, not
//! a security hash: two URLs deriving the same pair are deliberately treated
//! as the same resource.

use std::fmt;

use dashmap::DashMap;
use md5::{Digest, Md5};

/// Identity of a cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider_key: u64,
    pub file_key: u64,
}

impl CacheKey {
    /// A key is valid only when both halves hashed to a non-zero value,
    /// i.e. the URL carried both a provider portion and a file name.
    pub fn is_valid(&self) -> bool {
        self.provider_key > 0 && self.file_key > 0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_key, self.file_key)
    }
}

/// Split a URL into its provider prefix and file name.
///
/// The provider is everything after the last `"://"` up to and including the
/// last `/`; the file name is the final path segment. Empty or malformed
/// input yields `("", "")`; a URL without a path separator after the scheme
/// yields an empty file name.
pub fn split_url(url: &str) -> (&str, &str) {
    if url.is_empty() {
        return ("", "");
    }
    let Some(scheme_end) = url.rfind("://") else {
        return ("", "");
    };
    let rest = &url[scheme_end + 3..];
    match rest.rfind('/') {
        Some(slash) => (&rest[..=slash], &rest[slash + 1..]),
        None => (rest, ""),
    }
}

/// Weighted byte sum over the 16-byte MD5 digest of `s`:
/// `Σ digest[i] * 10^(i+1)`.
///
/// The empty string hashes to 0 so that malformed URLs derive invalid keys.
/// The maximum possible sum (all digest bytes 255) stays below `u64::MAX`.
pub fn weighted_hash(s: &str) -> u64 {
    if s.is_empty() {
        return 0;
    }
    let digest = Md5::digest(s.as_bytes());
    digest
        .iter()
        .enumerate()
        .map(|(i, byte)| u64::from(*byte) * 10u64.pow(i as u32 + 1))
        .sum()
}

/// Derives cache keys from URLs, memoizing each distinct substring hash for
/// the lifetime of the deriver.
#[derive(Debug, Default)]
pub struct KeyDeriver {
    memo: DashMap<String, u64>,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive(&self, url: &str) -> CacheKey {
        let (provider, file) = split_url(url);
        CacheKey {
            provider_key: self.hash_memoized(provider),
            file_key: self.hash_memoized(file),
        }
    }

    fn hash_memoized(&self, s: &str) -> u64 {
        if let Some(hash) = self.memo.get(s) {
            return *hash;
        }
        let hash = weighted_hash(s);
        self.memo.insert(s.to_owned(), hash);
        hash
    }
}
