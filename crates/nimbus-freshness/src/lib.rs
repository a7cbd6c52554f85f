//! Last-mutation timestamps for named remote resources.
//!
//! A small side table maps `(service, resource name)` to the wall-clock time of the
//! last mutation. Local caches compare their own write time against it to decide
//! whether they are stale, and the idle queue reaper uses it to find queues nobody
//! has touched in a while. The signal is deliberately approximate: writers on
//! different hosts have different clocks, so readers allow for skew.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nimbus_backend::{
    retry_transient, BackendError, Item, ItemKey, KeyValueTable, ResourceKind, RetryPolicy,
    TableSchema,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_TABLE_NAME: &str = "nimbus-metadata";

/// Service name used for pub/sub node queues.
pub const SERVICE_QUEUE: &str = "queue";
/// Service name used for cached table scans.
pub const SERVICE_TABLE: &str = "table";

const PARTITION_KEY: &str = "service";
const SORT_KEY: &str = "name";
const MTIME: &str = "mtime";
const MTIME_HUMAN: &str = "mtime_human";

pub type Result<T> = std::result::Result<T, FreshnessError>;

#[derive(Debug, thiserror::Error)]
pub enum FreshnessError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

impl FreshnessError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(err) if err.is_transient())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FreshnessRecord {
    pub service: String,
    pub resource_name: String,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
    pub mtime_human: Option<String>,
}

/// Handle to the freshness side table.
///
/// The table is created lazily: the first write that finds it missing creates
/// it and retries, so deleting the table is a valid way to reset every record.
pub struct FreshnessTable {
    table: Arc<dyn KeyValueTable>,
    table_name: String,
    retry: RetryPolicy,
}

impl FreshnessTable {
    pub fn new(table: Arc<dyn KeyValueTable>) -> Self {
        Self {
            table,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn schema(&self) -> TableSchema {
        TableSchema::new(&self.table_name, PARTITION_KEY).with_sort_key(SORT_KEY)
    }

    /// Record "now" as the last mutation of `resource_name` and return it.
    pub fn touch(&self, service: &str, resource_name: &str) -> Result<f64> {
        self.touch_at(service, resource_name, SystemTime::now())
    }

    pub fn touch_at(&self, service: &str, resource_name: &str, at: SystemTime) -> Result<f64> {
        let mtime = epoch_seconds(at);
        let mtime_human = OffsetDateTime::from(at).format(&Rfc3339)?;

        let mut item = Item::new();
        item.insert(PARTITION_KEY.to_string(), Value::from(service));
        item.insert(SORT_KEY.to_string(), Value::from(resource_name));
        item.insert(MTIME.to_string(), Value::from(mtime));
        item.insert(MTIME_HUMAN.to_string(), Value::from(mtime_human));

        match self.put(item.clone()) {
            Err(err) if err.is_not_found_of(ResourceKind::Table) => {
                tracing::info!(
                    target = "nimbus.freshness",
                    table = %self.table_name,
                    "freshness table missing; creating it"
                );
                retry_transient(&self.retry, "create_table", || {
                    self.table.create_table(&self.schema())
                })?;
                self.put(item)?;
            }
            other => other?,
        }

        tracing::trace!(
            target = "nimbus.freshness",
            service,
            name = resource_name,
            mtime,
            "touched"
        );
        Ok(mtime)
    }

    /// Last recorded mutation time, or `None` when it was never recorded (or the
    /// table does not exist yet). Callers treat `None` as stale.
    pub fn get_mtime(&self, service: &str, resource_name: &str) -> Result<Option<f64>> {
        Ok(self
            .get_record(service, resource_name)?
            .map(|record| record.mtime))
    }

    pub fn get_record(&self, service: &str, resource_name: &str) -> Result<Option<FreshnessRecord>> {
        let key = ItemKey::partition(PARTITION_KEY, service).with_sort(SORT_KEY, resource_name);
        let item = match retry_transient(&self.retry, "get_item", || {
            self.table.get_item(&self.table_name, &key)
        }) {
            Ok(item) => item,
            Err(err) if err.is_not_found_of(ResourceKind::Table) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let Some(item) = item else {
            return Ok(None);
        };
        let Some(mtime) = item.get(MTIME).and_then(Value::as_f64) else {
            tracing::warn!(
                target = "nimbus.freshness",
                service,
                name = resource_name,
                "freshness record has no numeric mtime; treating as absent"
            );
            return Ok(None);
        };

        Ok(Some(FreshnessRecord {
            service: service.to_string(),
            resource_name: resource_name.to_string(),
            mtime,
            mtime_human: item
                .get(MTIME_HUMAN)
                .and_then(Value::as_str)
                .map(str::to_string),
        }))
    }

    fn put(&self, item: Item) -> std::result::Result<(), BackendError> {
        retry_transient(&self.retry, "put_item", || {
            self.table.put_item(&self.table_name, item.clone())
        })
    }
}

/// Seconds since the Unix epoch; negative for times before it.
pub fn epoch_seconds(at: SystemTime) -> f64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(err) => -err.duration().as_secs_f64(),
    }
}

/// Whether a local copy written at `local_written` (epoch seconds) is stale
/// relative to the recorded remote mutation time.
///
/// An absent remote time is always stale. Otherwise the local copy is trusted
/// while `local_written + skew_allowance >= remote_mtime`.
pub fn is_stale(local_written: f64, remote_mtime: Option<f64>, skew_allowance: Duration) -> bool {
    match remote_mtime {
        None => true,
        Some(remote) => local_written + skew_allowance.as_secs_f64() < remote,
    }
}
