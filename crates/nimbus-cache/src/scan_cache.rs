//! Local snapshot of a full table scan, refreshed when the table's freshness
//! record moves past the snapshot.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nimbus_backend::{retry_transient, Item, ItemKey, KeyValueTable, RetryPolicy};
use nimbus_freshness::{is_stale, FreshnessTable, SERVICE_TABLE};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::util::{atomic_write, modified_epoch_seconds, now_epoch_seconds, remove_file_best_effort};

const SNAPSHOT_VERSION: u32 = 1;

pub const DEFAULT_CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq)]
pub struct ScanCacheConfig {
    pub cache_dir: PathBuf,
    /// Added to the snapshot's write time before comparing it against the
    /// freshness record, which may come from a machine with a different clock.
    pub clock_skew_allowance: Duration,
    /// Snapshots older than this are refetched regardless of the freshness record.
    pub cache_life: Option<Duration>,
    pub retry: RetryPolicy,
}

impl ScanCacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            clock_skew_allowance: DEFAULT_CLOCK_SKEW_ALLOWANCE,
            cache_life: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScanRead {
    pub items: Vec<Item>,
    /// `true` when the items came from the local snapshot.
    pub cache_hit: bool,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    table: String,
    items: Vec<Item>,
}

/// Cached full scans of one table.
pub struct RemoteScanCache {
    table: Arc<dyn KeyValueTable>,
    freshness: Arc<FreshnessTable>,
    table_name: String,
    config: ScanCacheConfig,
}

impl RemoteScanCache {
    pub fn new(
        table: Arc<dyn KeyValueTable>,
        freshness: Arc<FreshnessTable>,
        table_name: impl Into<String>,
        config: ScanCacheConfig,
    ) -> Self {
        Self {
            table,
            freshness,
            table_name: table_name.into(),
            config,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}.json", self.table_name))
    }

    /// Every item of the table, from the local snapshot when it is still fresh.
    ///
    /// `invalidate` discards the snapshot first. A failed remote scan is an
    /// error; it never degrades into an empty result.
    pub fn scan_cached(&self, invalidate: bool) -> Result<ScanRead> {
        fs::create_dir_all(&self.config.cache_dir)?;
        let path = self.snapshot_path();
        if invalidate {
            remove_file_best_effort(&path, "scan_cache.invalidate");
        }

        if let Some(items) = self.read_fresh_snapshot()? {
            tracing::debug!(
                target = "nimbus.cache",
                table = %self.table_name,
                items = items.len(),
                "scan cache hit"
            );
            return Ok(ScanRead {
                items,
                cache_hit: true,
            });
        }

        tracing::info!(target = "nimbus.cache", table = %self.table_name, "scanning table");
        let items = retry_transient(&self.config.retry, "scan", || {
            self.table.scan(&self.table_name)
        })?;

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            table: self.table_name.clone(),
            items,
        };
        let encoded = serde_json::to_vec(&snapshot)?;
        if let Err(err) = atomic_write(&path, &encoded) {
            tracing::warn!(
                target = "nimbus.cache",
                path = %path.display(),
                error = %err,
                "failed to persist scan snapshot"
            );
        }

        Ok(ScanRead {
            items: snapshot.items,
            cache_hit: false,
        })
    }

    /// Write through to the table and record the mutation.
    pub fn put_item(&self, item: Item) -> Result<()> {
        retry_transient(&self.config.retry, "put_item", || {
            self.table.put_item(&self.table_name, item.clone())
        })?;
        self.record_mutation()
    }

    pub fn delete_item(&self, key: &ItemKey) -> Result<()> {
        retry_transient(&self.config.retry, "delete_item", || {
            self.table.delete_item(&self.table_name, key)
        })?;
        self.record_mutation()
    }

    fn record_mutation(&self) -> Result<()> {
        self.freshness.touch(SERVICE_TABLE, &self.table_name)?;
        // Our own write falls inside the skew allowance; drop the local copy so
        // this process does not keep serving it.
        remove_file_best_effort(&self.snapshot_path(), "scan_cache.local_mutation");
        Ok(())
    }

    fn read_fresh_snapshot(&self) -> Result<Option<Vec<Item>>> {
        let path = self.snapshot_path();
        let Some(written) = modified_epoch_seconds(&path)? else {
            return Ok(None);
        };

        if let Some(life) = self.config.cache_life {
            if now_epoch_seconds() - written > life.as_secs_f64() {
                tracing::debug!(
                    target = "nimbus.cache",
                    table = %self.table_name,
                    "scan snapshot outlived its cache life"
                );
                return Ok(None);
            }
        }

        let remote = self.freshness.get_mtime(SERVICE_TABLE, &self.table_name)?;
        if is_stale(written, remote, self.config.clock_skew_allowance) {
            tracing::debug!(
                target = "nimbus.cache",
                table = %self.table_name,
                written,
                remote = ?remote,
                "scan snapshot is stale"
            );
            return Ok(None);
        }

        let decoded = fs::read(&path)
            .map_err(|err| err.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<Snapshot>(&bytes)
                    .map_err(|err| CacheError::from(err).to_string())
            });
        match decoded {
            Ok(snapshot)
                if snapshot.version == SNAPSHOT_VERSION && snapshot.table == self.table_name =>
            {
                Ok(Some(snapshot.items))
            }
            Ok(_) => {
                tracing::warn!(
                    target = "nimbus.cache",
                    path = %path.display(),
                    "scan snapshot belongs to another table or version; discarding"
                );
                remove_file_best_effort(&path, "scan_cache.mismatch");
                Ok(None)
            }
            Err(err) => {
                tracing::warn!(
                    target = "nimbus.cache",
                    path = %path.display(),
                    error = %err,
                    "corrupt scan snapshot; discarding"
                );
                remove_file_best_effort(&path, "scan_cache.corrupt");
                Ok(None)
            }
        }
    }
}
