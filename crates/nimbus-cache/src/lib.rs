//! Local caches in front of the remote backend.
//!
//! - [`LruDiskCache`] / [`lru_cache_write`]: size-bounded content store with
//!   least-recently-accessed eviction.
//! - [`RemoteScanCache`]: full table scans served from a local snapshot until the
//!   table's freshness record says otherwise.
//! - [`CachedObjectFetcher`]: object downloads deduplicated through the LRU cache.
//!
//! The default cache directory honours `NIMBUS_CACHE_DIR`.

mod error;
mod lru;
mod object_cache;
mod scan_cache;
mod util;

pub use error::{CacheError, Result};
pub use lru::{lru_cache_write, CacheLimits, LocalData, LruDiskCache};
pub use object_cache::{object_cache_key, CachedObjectFetcher, DownloadStatus};
pub use scan_cache::{RemoteScanCache, ScanCacheConfig, ScanRead, DEFAULT_CLOCK_SKEW_ALLOWANCE};
pub use util::atomic_write;

use std::path::PathBuf;

pub const CACHE_DIR_ENV: &str = "NIMBUS_CACHE_DIR";

/// `$NIMBUS_CACHE_DIR` when set and non-empty, otherwise `nimbus` under the
/// system temporary directory.
pub fn default_cache_dir() -> PathBuf {
    match std::env::var_os(CACHE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("nimbus"),
    }
}
