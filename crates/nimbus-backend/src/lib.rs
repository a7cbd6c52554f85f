//! Collaborator contracts for the managed topic/queue/table/object backend.
//!
//! Everything above this crate talks to the backend through four traits:
//! - [`TopicService`]: create topics, publish, subscribe queues to topics
//! - [`QueueService`]: per-node queues with long-poll receive and access policies
//! - [`KeyValueTable`]: the small partition/sort keyed tables used for freshness
//!   records and cached scans
//! - [`ObjectStore`]: object metadata + download for the object cache
//!
//! Handles are always injected (`Arc<dyn Trait>`) by the caller; there is no
//! process-wide session. [`MemoryBackend`] implements all four traits in memory and
//! is what the test suites run against. The `aws` feature adds [`AwsBackend`].

mod error;
mod memory;
mod retry;

#[cfg(feature = "aws")]
mod aws;

pub use error::{BackendError, ResourceKind, Result};
pub use memory::{MemoryBackend, MemoryFault};
pub use retry::{retry_transient, RetryPolicy, RetryableError};

#[cfg(feature = "aws")]
pub use aws::AwsBackend;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::time::Duration;

/// A table item: attribute name to (already coerced) attribute value.
pub type Item = BTreeMap<String, serde_json::Value>;

/// Attributes attached to a published message.
pub type MessageAttributes = BTreeMap<String, String>;

/// Largest batch a single receive call may return.
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Longest long-poll wait the queue service accepts.
pub const MAX_RECEIVE_WAIT: Duration = Duration::from_secs(20);

pub trait TopicService: Send + Sync {
    /// Create the topic if it does not exist and return its ARN. Idempotent.
    fn create_topic(&self, name: &str) -> Result<String>;

    /// Publish `payload` to the topic and return the backend message id.
    fn publish(&self, topic_arn: &str, payload: &str, attributes: &MessageAttributes)
        -> Result<String>;

    /// Subscribe `endpoint` (e.g. a queue ARN for `protocol = "sqs"`) to the topic.
    fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String>;
}

pub trait QueueService: Send + Sync {
    /// Create the queue if it does not exist and return its URL. Idempotent.
    fn create_queue(&self, name: &str) -> Result<String>;

    fn queue_exists(&self, name: &str) -> Result<bool>;

    /// Delete the queue. Reports [`BackendError::NotFound`] if it is already gone.
    fn delete_queue(&self, name: &str) -> Result<()>;

    fn get_arn(&self, name: &str) -> Result<String>;

    /// Receive up to `request.max_messages`, blocking for at most `request.wait_time`
    /// when nothing is available.
    fn receive(&self, name: &str, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>>;

    fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<()>;

    /// Replace the queue's access policy document.
    fn set_attributes(&self, name: &str, policy_json: &str) -> Result<()>;

    /// Names of all queues starting with `prefix`.
    fn list_queues(&self, prefix: &str) -> Result<Vec<String>>;
}

pub trait KeyValueTable: Send + Sync {
    /// Read one item. A missing table is reported as `NotFound(Table)`.
    fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>>;

    /// Insert or replace the item whose key attributes are contained in `item`.
    fn put_item(&self, table: &str, item: Item) -> Result<()>;

    fn delete_item(&self, table: &str, key: &ItemKey) -> Result<()>;

    /// Read every item in the table.
    fn scan(&self, table: &str) -> Result<Vec<Item>>;

    /// Create the table and wait until it is usable. Creating an existing table is
    /// not an error.
    fn create_table(&self, schema: &TableSchema) -> Result<()>;

    fn delete_table(&self, table: &str) -> Result<()>;
}

pub trait ObjectStore: Send + Sync {
    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Primary key layout of a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Extract this schema's key from a full item.
    pub fn key_of(&self, item: &Item) -> Option<ItemKey> {
        let partition = item.get(&self.partition_key)?;
        let mut key = ItemKey::partition(&self.partition_key, partition.clone());
        if let Some(sort_key) = &self.sort_key {
            let sort = item.get(sort_key)?;
            key = key.with_sort(sort_key, sort.clone());
        }
        Some(key)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub value: serde_json::Value,
}

/// Primary key of one item (partition attribute plus optional sort attribute).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: KeyAttribute,
    pub sort: Option<KeyAttribute>,
}

impl ItemKey {
    pub fn partition(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            partition: KeyAttribute {
                name: name.into(),
                value: value.into(),
            },
            sort: None,
        }
    }

    pub fn with_sort(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.sort = Some(KeyAttribute {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: u32,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: MAX_RECEIVE_BATCH,
            visibility_timeout: Duration::from_secs(30),
            wait_time: MAX_RECEIVE_WAIT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Opaque handle used to delete (acknowledge) this delivery.
    pub receipt_handle: String,
    pub body: String,
}

/// Envelope the topic service wraps around payloads it delivers into queues.
///
/// Only `Message` is required; the backend adds more fields which are ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopicNotification {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub topic_arn: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    /// Hex SHA-512 of the content when the store recorded one.
    pub sha512: Option<String>,
    pub etag: Option<String>,
    pub last_modified_millis: Option<u64>,
}

/// Lowercase hex SHA-512 of `bytes`.
pub fn content_sha512(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}
