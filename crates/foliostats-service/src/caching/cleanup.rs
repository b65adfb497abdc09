use std::fs::{read_dir, remove_file};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::metric;

use super::store::{catch_not_found, now_millis};
use super::{CacheEntry, CacheError, CacheResult, CacheStore};

/// Entry function for the cleanup command.
///
/// This removes all cache entries that expired longer than the configured
/// retention ago. If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    let store = CacheStore::from_config(&config)
        .context("failed to open the cache directory")?;
    let stats = store
        .sweep(config.retention, dry_run)
        .context("no caching configured! Did you provide a path to your config file?")?;

    tracing::info!(
        "Cleanup complete: scanned {} entries, removed {} ({} unreadable)",
        stats.scanned,
        stats.removed,
        stats.errors,
    );

    Ok(())
}

/// Counters describing one sweep over the cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entry files inspected.
    pub scanned: usize,
    /// Entry files removed (or that would be removed in a dry run).
    pub removed: usize,
    /// Entry files that could not be read or decoded.
    pub errors: usize,
}

impl CacheStore {
    /// Sweeps the cache directory, removing entries that expired more than
    /// `retention` ago.
    ///
    /// Stale entries within the retention window are kept, since their
    /// payload still serves as a fallback for failed refreshes. Entries
    /// that cannot be decoded are removed as well. Only files whose name
    /// is a full hex digest are considered; anything else in the directory
    /// (such as in-flight temporary files) is left alone.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn sweep(&self, retention: Duration, dry_run: bool) -> CacheResult<SweepStats> {
        let Some(dir) = self.directory() else {
            return Err(CacheError::Disabled);
        };

        let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
        let mut stats = SweepStats::default();

        for entry in read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            stats.scanned += 1;

            let expired = match std::fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                    Ok(entry) => entry.expires_at < cutoff,
                    Err(e) => {
                        tracing::warn!(
                            "Removing undecodable cache entry `{}`: {}",
                            path.display(),
                            e
                        );
                        stats.errors += 1;
                        true
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read cache entry `{}`: {}", path.display(), e);
                    stats.errors += 1;
                    continue;
                }
            };

            if expired {
                tracing::debug!("Removing file `{}`", path.display());
                if !dry_run {
                    catch_not_found(|| remove_file(&path))?;
                }
                stats.removed += 1;
            }
        }

        metric!(gauge("cache.sweep.scanned") = stats.scanned as u64);
        metric!(counter("cache.sweep.removed") += stats.removed as i64);
        metric!(counter("cache.sweep.errors") += stats.errors as i64);

        Ok(stats)
    }
}
