use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::metric;

use super::key::CacheKey;
use super::{CacheError, CacheResult};

/// The current time in milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single persisted cache entry.
///
/// The raw key is stored alongside the value so entries remain
/// identifiable when inspecting the cache directory by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The raw key this entry was stored under.
    pub key: String,
    /// The cached payload.
    pub value: serde_json::Value,
    /// When this entry stops being fresh, in milliseconds since the unix epoch.
    pub expires_at: u64,
}

impl CacheEntry {
    /// Whether the entry is still within its time-to-live.
    ///
    /// Entries written with a zero time-to-live are immediately stale but
    /// are stored nevertheless, so that the expiration policy is decided
    /// at read time rather than at write time.
    pub fn is_fresh(&self) -> bool {
        now_millis() < self.expires_at
    }
}

/// A file-system backed store for JSON payloads.
///
/// Every entry lives in its own file named after the SHA-256 of its key.
/// Writes go through a temporary file in the same directory and are moved
/// into place atomically, so concurrent readers never observe a partially
/// written entry.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: Option<PathBuf>,
}

impl CacheStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    ///
    /// With no directory, the store is disabled: reads and writes fail with
    /// [`CacheError::Disabled`], which callers are expected to absorb.
    pub fn new(dir: Option<PathBuf>) -> CacheResult<Self> {
        if let Some(ref dir) = dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { dir })
    }

    pub fn from_config(config: &Config) -> CacheResult<Self> {
        Self::new(config.cache_dir.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// The directory entries are stored in, if caching is enabled.
    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Looks up the entry stored under `key`.
    ///
    /// Stale entries are returned as well; it is up to the caller to check
    /// [`CacheEntry::is_fresh`]. A disabled store rejects the lookup.
    pub async fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let Some(ref dir) = self.dir else {
            return Err(CacheError::Disabled);
        };

        let path = dir.join(key.file_name());
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Malformed(e.to_string()))?;
        Ok(Some(entry))
    }

    /// Stores `value` under `key` with the given time-to-live.
    ///
    /// An existing entry for the same key is replaced, even when the new
    /// time-to-live is zero. A disabled store rejects the write.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Duration,
    ) -> CacheResult {
        let Some(ref dir) = self.dir else {
            return Err(CacheError::Disabled);
        };

        let entry = CacheEntry {
            key: key.as_str().to_owned(),
            value,
            expires_at: now_millis() + ttl.as_millis() as u64,
        };
        let bytes = serde_json::to_vec(&entry)?;
        let size = bytes.len();

        // `NamedTempFile` and `persist` are blocking, keep them off the
        // executor threads.
        let dir = dir.clone();
        let path = dir.join(key.file_name());
        tokio::task::spawn_blocking(move || -> CacheResult {
            let mut file = NamedTempFile::new_in(&dir)?;
            file.write_all(&bytes)?;
            file.persist(path).map_err(CacheError::from_std_error)?;
            Ok(())
        })
        .await
        .map_err(CacheError::from_std_error)??;

        metric!(histogram("cache.file.size") = size as u64);
        metric!(counter("cache.write") += 1);
        Ok(())
    }
}

/// Invoke the provided function, turning "not found" errors into `None`.
pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
