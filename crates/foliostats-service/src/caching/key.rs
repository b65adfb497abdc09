use std::fmt;

use sha2::{Digest, Sha256};

/// The logical identifier of a cache entry.
///
/// Keys are arbitrary strings chosen by the caller. On disk, an entry is
/// stored under the hex-encoded SHA-256 of its key, which keeps file names
/// filesystem-safe no matter what the key contains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
}

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The raw key as provided by the caller.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The file name this entry is stored under.
    pub fn file_name(&self) -> String {
        let hash: [u8; 32] = Sha256::digest(self.key.as_bytes()).into();
        hex::encode(hash)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key.fmt(f)
    }
}
