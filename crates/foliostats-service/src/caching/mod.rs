//! # Persistent response caching
//!
//! Responses from the upstream APIs change rarely compared to how often they
//! are read, so the service keeps a file-system cache of JSON payloads next
//! to the fetch layer.
//!
//! Every entry is a small JSON file holding the raw key, the payload, and an
//! absolute expiration timestamp. The file name is the hex-encoded SHA-256 of
//! the key (see [`CacheKey`]), which keeps arbitrary key strings out of the
//! file system. Writes happen through a temporary file in the same directory
//! followed by an atomic rename, so readers never see torn entries.
//!
//! Expiration is decided at read time: [`CacheStore::get`] returns stale
//! entries too, and callers check [`CacheEntry::is_fresh`]. This allows
//! entries written with a zero time-to-live to act as a fallback payload
//! without ever being served as fresh.
//!
//! Old entries are removed by [`CacheStore::sweep`], driven by the `cleanup`
//! command. The sweep keeps stale entries within the configured retention
//! and only deletes those that expired longer ago than that.
//!
//! ### Metrics
//!
//! - `cache.write`: Counter for entries written to disk.
//! - `cache.file.size`: A histogram for the size (in bytes) of written entries.
//! - `cache.sweep.scanned` / `cache.sweep.removed` / `cache.sweep.errors`:
//!   Per-sweep statistics.
//!
//! The hit/miss counters are emitted by the fetch layer, which is the only
//! place that knows whether a returned entry was actually usable.

mod cleanup;
mod error;
mod key;
mod store;

pub use cleanup::{SweepStats, cleanup};
pub use error::{CacheError, CacheResult};
pub use key::CacheKey;
pub use store::{CacheEntry, CacheStore, now_millis};
