use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::{
    content_sha512, BackendError, Item, ItemKey, KeyValueTable, MessageAttributes,
    ObjectMetadata, ObjectStore, QueueService, ReceiveRequest, ReceivedMessage, ResourceKind,
    Result, TableSchema, TopicNotification, TopicService, MAX_RECEIVE_BATCH,
};

const ARN_PREFIX: &str = "arn:nimbus";
const ACCOUNT: &str = "000000000000";
const REGION: &str = "local";

/// Operations of [`MemoryBackend`] that can be made to fail on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryFault {
    Publish,
    Receive,
    SetQueueAttributes,
    DeleteQueue,
    PutItem,
    Scan,
}

/// In-process implementation of every backend trait.
///
/// It models the parts of the managed services the core relies on:
/// - topics fan out to subscribed queues, but only queues whose access policy
///   allows the topic's ARN as `aws:SourceArn`
/// - deliveries are wrapped in a [`TopicNotification`] envelope
/// - received messages stay invisible for the visibility timeout and reappear
///   unless deleted
/// - `receive` long-polls up to the requested wait time
/// - writes to a table that does not exist fail with `NotFound(Table)`
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    queue_activity: Condvar,
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, MemoryTopic>,
    queues: BTreeMap<String, MemoryQueue>,
    tables: BTreeMap<String, MemoryTable>,
    objects: BTreeMap<(String, String), StoredObject>,
    faults: HashMap<MemoryFault, u32>,
    next_id: u64,
}

struct MemoryTopic {
    arn: String,
    subscriptions: Vec<Subscription>,
}

#[derive(Clone)]
struct Subscription {
    arn: String,
    protocol: String,
    endpoint: String,
}

struct MemoryQueue {
    arn: String,
    url: String,
    policy: Option<String>,
    messages: VecDeque<StoredMessage>,
}

struct StoredMessage {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

struct MemoryTable {
    schema: TableSchema,
    items: BTreeMap<String, Item>,
}

struct StoredObject {
    bytes: Vec<u8>,
    sha512: Option<String>,
    etag: String,
    last_modified_millis: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08}", self.next_id)
    }

    fn take_fault(&mut self, fault: MemoryFault) -> Result<()> {
        match self.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BackendError::transient(format!("injected {fault:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn queue(&self, name: &str) -> Result<&MemoryQueue> {
        self.queues
            .get(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Queue, name))
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut MemoryQueue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Queue, name))
    }

    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Table, name))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Table, name))
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls of `fault` fail with a transient error.
    pub fn inject_transient_failures(&self, fault: MemoryFault, count: u32) {
        self.state.lock().faults.insert(fault, count);
    }

    /// Store an object; its SHA-512 is recorded as object metadata.
    pub fn put_object(&self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        let sha512 = content_sha512(&bytes);
        self.insert_object(bucket, key, bytes, Some(sha512));
    }

    /// Store an object the way a plain upload does, with no SHA-512 in its metadata.
    pub fn put_object_unhashed(&self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) {
        self.insert_object(bucket, key, bytes.into(), None);
    }

    fn insert_object(&self, bucket: &str, key: &str, bytes: Vec<u8>, sha512: Option<String>) {
        let stored = StoredObject {
            etag: content_sha512(&bytes)[..32].to_string(),
            bytes,
            sha512,
            last_modified_millis: now_millis(),
        };
        self.state
            .lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), stored);
    }

    /// Number of messages (visible or in flight) currently held by `queue`.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Put a raw body straight onto a queue, bypassing topics.
    pub fn send_raw(&self, queue: &str, body: impl Into<String>) -> Result<String> {
        let mut state = self.state.lock();
        let message_id = state.next_id("msg");
        state.queue_mut(queue)?.messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            visible_at: Instant::now(),
            receipt_handle: None,
        });
        self.queue_activity.notify_all();
        Ok(message_id)
    }
}

impl TopicService for MemoryBackend {
    fn create_topic(&self, name: &str) -> Result<String> {
        validate_resource_name(name, 256)?;
        let mut state = self.state.lock();
        let topic = state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| MemoryTopic {
                arn: format!("{ARN_PREFIX}:sns:{REGION}:{ACCOUNT}:{name}"),
                subscriptions: Vec::new(),
            });
        Ok(topic.arn.clone())
    }

    fn publish(
        &self,
        topic_arn: &str,
        payload: &str,
        _attributes: &MessageAttributes,
    ) -> Result<String> {
        let mut state = self.state.lock();
        state.take_fault(MemoryFault::Publish)?;

        let subscriptions = state
            .topics
            .values()
            .find(|t| t.arn == topic_arn)
            .map(|t| t.subscriptions.clone())
            .ok_or_else(|| BackendError::not_found(ResourceKind::Topic, topic_arn))?;

        let message_id = state.next_id("msg");
        let envelope = serde_json::to_string(&TopicNotification {
            kind: "Notification".to_string(),
            message_id: message_id.clone(),
            topic_arn: topic_arn.to_string(),
            message: payload.to_string(),
        })?;

        let now = Instant::now();
        for subscription in subscriptions.iter().filter(|s| s.protocol == "sqs") {
            let Some(queue) = state
                .queues
                .values_mut()
                .find(|q| q.arn == subscription.endpoint)
            else {
                // Subscriptions outlive deleted queues; deliveries to them are dropped.
                continue;
            };
            if !policy_allows(queue.policy.as_deref(), topic_arn) {
                tracing::debug!(
                    target = "nimbus.backend",
                    queue = %queue.arn,
                    topic = %topic_arn,
                    subscription = %subscription.arn,
                    "queue policy does not allow topic; delivery dropped"
                );
                continue;
            }
            queue.messages.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: envelope.clone(),
                visible_at: now,
                receipt_handle: None,
            });
        }
        self.queue_activity.notify_all();
        Ok(message_id)
    }

    fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String> {
        let mut state = self.state.lock();
        let subscription_arn = format!("{topic_arn}:{}", state.next_id("sub"));
        let topic = state
            .topics
            .values_mut()
            .find(|t| t.arn == topic_arn)
            .ok_or_else(|| BackendError::not_found(ResourceKind::Topic, topic_arn))?;

        if let Some(existing) = topic
            .subscriptions
            .iter()
            .find(|s| s.protocol == protocol && s.endpoint == endpoint)
        {
            return Ok(existing.arn.clone());
        }
        topic.subscriptions.push(Subscription {
            arn: subscription_arn.clone(),
            protocol: protocol.to_string(),
            endpoint: endpoint.to_string(),
        });
        Ok(subscription_arn)
    }
}

impl QueueService for MemoryBackend {
    fn create_queue(&self, name: &str) -> Result<String> {
        validate_resource_name(name, 80)?;
        let mut state = self.state.lock();
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| MemoryQueue {
                arn: format!("{ARN_PREFIX}:sqs:{REGION}:{ACCOUNT}:{name}"),
                url: format!("memory://{REGION}/{ACCOUNT}/{name}"),
                policy: None,
                messages: VecDeque::new(),
            });
        Ok(queue.url.clone())
    }

    fn queue_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().queues.contains_key(name))
    }

    fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(MemoryFault::DeleteQueue)?;
        if state.queues.remove(name).is_none() {
            return Err(BackendError::not_found(ResourceKind::Queue, name));
        }
        // Wake long-pollers so they observe the deletion.
        self.queue_activity.notify_all();
        Ok(())
    }

    fn get_arn(&self, name: &str) -> Result<String> {
        Ok(self.state.lock().queue(name)?.arn.clone())
    }

    fn receive(&self, name: &str, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        if request.max_messages == 0 || request.max_messages > MAX_RECEIVE_BATCH {
            return Err(BackendError::invalid(format!(
                "max_messages must be within 1..={MAX_RECEIVE_BATCH}, got {}",
                request.max_messages
            )));
        }

        let deadline = Instant::now() + request.wait_time;
        let mut state = self.state.lock();
        state.take_fault(MemoryFault::Receive)?;

        loop {
            let now = Instant::now();
            let mut receipts = Vec::new();
            let mut next_visible: Option<Instant> = None;
            {
                let next_id = state.next_id;
                let queue = state.queue_mut(name)?;
                let mut issued = 0u64;
                for message in queue.messages.iter_mut() {
                    if receipts.len() >= request.max_messages as usize {
                        break;
                    }
                    if message.visible_at > now {
                        next_visible = Some(match next_visible {
                            Some(at) => at.min(message.visible_at),
                            None => message.visible_at,
                        });
                        continue;
                    }
                    issued += 1;
                    let receipt = format!("{}#{}", message.message_id, next_id + issued);
                    message.receipt_handle = Some(receipt.clone());
                    message.visible_at = now + request.visibility_timeout;
                    receipts.push(ReceivedMessage {
                        message_id: message.message_id.clone(),
                        receipt_handle: receipt,
                        body: message.body.clone(),
                    });
                }
                state.next_id = next_id + issued;
            }

            if !receipts.is_empty() || now >= deadline {
                return Ok(receipts);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = self.queue_activity.wait_until(&mut state, wake_at);
        }
    }

    fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state.queue_mut(name)?;
        queue
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        Ok(())
    }

    fn set_attributes(&self, name: &str, policy_json: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(MemoryFault::SetQueueAttributes)?;
        serde_json::from_str::<serde_json::Value>(policy_json)
            .map_err(|err| BackendError::invalid(format!("policy is not valid JSON: {err}")))?;
        state.queue_mut(name)?.policy = Some(policy_json.to_string());
        Ok(())
    }

    fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .queues
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl KeyValueTable for MemoryBackend {
    fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>> {
        let state = self.state.lock();
        let table = state.table(table)?;
        Ok(table.items.get(&canonical_key(key)).cloned())
    }

    fn put_item(&self, table: &str, item: Item) -> Result<()> {
        let mut state = self.state.lock();
        state.take_fault(MemoryFault::PutItem)?;
        let table = state.table_mut(table)?;
        let key = table.schema.key_of(&item).ok_or_else(|| {
            BackendError::invalid(format!(
                "item is missing key attributes of table `{}`",
                table.schema.name
            ))
        })?;
        table.items.insert(canonical_key(&key), item);
        Ok(())
    }

    fn delete_item(&self, table: &str, key: &ItemKey) -> Result<()> {
        let mut state = self.state.lock();
        state.table_mut(table)?.items.remove(&canonical_key(key));
        Ok(())
    }

    fn scan(&self, table: &str) -> Result<Vec<Item>> {
        let mut state = self.state.lock();
        state.take_fault(MemoryFault::Scan)?;
        Ok(state.table(table)?.items.values().cloned().collect())
    }

    fn create_table(&self, schema: &TableSchema) -> Result<()> {
        validate_resource_name(&schema.name, 255)?;
        let mut state = self.state.lock();
        state
            .tables
            .entry(schema.name.clone())
            .or_insert_with(|| MemoryTable {
                schema: schema.clone(),
                items: BTreeMap::new(),
            });
        Ok(())
    }

    fn delete_table(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(ResourceKind::Table, table))
    }
}

impl ObjectStore for MemoryBackend {
    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let state = self.state.lock();
        let object = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| BackendError::not_found(ResourceKind::Object, format!("{bucket}/{key}")))?;
        Ok(ObjectMetadata {
            size: object.bytes.len() as u64,
            sha512: object.sha512.clone(),
            etag: Some(object.etag.clone()),
            last_modified_millis: Some(object.last_modified_millis),
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| object.bytes.clone())
            .ok_or_else(|| BackendError::not_found(ResourceKind::Object, format!("{bucket}/{key}")))
    }
}

fn canonical_key(key: &ItemKey) -> String {
    let sort = key.sort.as_ref().map(|s| &s.value);
    serde_json::json!([key.partition.value, sort]).to_string()
}

/// Mirrors the managed service naming rule: 1..=max chars of `[A-Za-z0-9_-]`
/// (tables additionally allow `.`).
fn validate_resource_name(name: &str, max_len: usize) -> Result<()> {
    let legal = !name.is_empty()
        && name.len() <= max_len
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if legal {
        Ok(())
    } else {
        Err(BackendError::invalid(format!("illegal resource name {name:?}")))
    }
}

fn policy_allows(policy: Option<&str>, topic_arn: &str) -> bool {
    let Some(policy) = policy else {
        return false;
    };
    let Ok(policy) = serde_json::from_str::<serde_json::Value>(policy) else {
        return false;
    };
    let Some(statements) = policy.get("Statement").and_then(|s| s.as_array()) else {
        return false;
    };

    statements.iter().any(|statement| {
        let allows = statement.get("Effect").and_then(|e| e.as_str()) == Some("Allow");
        let sends = statement
            .get("Action")
            .and_then(|a| a.as_str())
            .is_some_and(|a| a.eq_ignore_ascii_case("sqs:SendMessage"));
        let source_matches = statement
            .get("Condition")
            .and_then(|c| c.as_object())
            .is_some_and(|conditions| {
                conditions.values().any(|condition| {
                    condition.get("aws:SourceArn").and_then(|v| v.as_str()) == Some(topic_arn)
                })
            });
        allows && sends && source_matches
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn allow_policy(queue_arn: &str, topic_arn: &str) -> String {
        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"Service": "sns.amazonaws.com"},
                "Action": "sqs:SendMessage",
                "Resource": queue_arn,
                "Condition": {"ArnEquals": {"aws:SourceArn": topic_arn}},
            }],
        })
        .to_string()
    }

    fn quick_receive() -> ReceiveRequest {
        ReceiveRequest {
            max_messages: 10,
            visibility_timeout: Duration::from_secs(30),
            wait_time: Duration::ZERO,
        }
    }

    #[test]
    fn publish_requires_matching_policy() {
        let backend = MemoryBackend::new();
        let topic = backend.create_topic("t").unwrap();
        backend.create_queue("q").unwrap();
        let queue_arn = backend.get_arn("q").unwrap();
        backend.subscribe(&topic, "sqs", &queue_arn).unwrap();

        backend.publish(&topic, "dropped", &MessageAttributes::new()).unwrap();
        assert_eq!(backend.queue_depth("q"), Some(0));

        backend
            .set_attributes("q", &allow_policy(&queue_arn, &topic))
            .unwrap();
        backend.publish(&topic, "kept", &MessageAttributes::new()).unwrap();

        let received = backend.receive("q", &quick_receive()).unwrap();
        assert_eq!(received.len(), 1);
        let envelope: TopicNotification = serde_json::from_str(&received[0].body).unwrap();
        assert_eq!(envelope.message, "kept");
        assert_eq!(envelope.topic_arn, topic);
    }

    #[test]
    fn received_messages_reappear_after_visibility_timeout() {
        let backend = MemoryBackend::new();
        backend.create_queue("q").unwrap();
        backend.send_raw("q", "body").unwrap();

        let request = ReceiveRequest {
            visibility_timeout: Duration::from_millis(20),
            ..quick_receive()
        };
        let first = backend.receive("q", &request).unwrap();
        assert_eq!(first.len(), 1);
        assert!(backend.receive("q", &request).unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(40));
        let second = backend.receive("q", &request).unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].receipt_handle, second[0].receipt_handle);

        backend.delete_message("q", &second[0].receipt_handle).unwrap();
        assert_eq!(backend.queue_depth("q"), Some(0));
    }

    #[test]
    fn long_poll_waits_for_a_message() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        backend.create_queue("q").unwrap();

        let sender = backend.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            sender.send_raw("q", "late").unwrap();
        });

        let request = ReceiveRequest {
            wait_time: Duration::from_secs(5),
            ..quick_receive()
        };
        let started = Instant::now();
        let received = backend.receive("q", &request).unwrap();
        handle.join().unwrap();

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "late");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn table_round_trip_uses_schema_key() {
        let backend = MemoryBackend::new();
        backend
            .create_table(&TableSchema::new("t", "id").with_sort_key("n"))
            .unwrap();
        let mut item = Item::new();
        item.insert("id".into(), json!("a"));
        item.insert("n".into(), json!(1));
        item.insert("v".into(), json!("first"));
        backend.put_item("t", item.clone()).unwrap();
        item.insert("v".into(), json!("second"));
        backend.put_item("t", item.clone()).unwrap();

        let key = ItemKey::partition("id", "a").with_sort("n", 1);
        assert_eq!(backend.get_item("t", &key).unwrap(), Some(item));
        assert_eq!(backend.scan("t").unwrap().len(), 1);

        backend.delete_item("t", &key).unwrap();
        assert_eq!(backend.get_item("t", &key).unwrap(), None);
    }

    #[test]
    fn rejects_illegal_names() {
        let backend = MemoryBackend::new();
        assert!(backend.create_queue("My Queue!").is_err());
        assert!(backend.create_topic("").is_err());
    }
}
