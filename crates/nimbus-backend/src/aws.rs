//! AWS SDK implementation of the backend traits (SNS topics, SQS queues, DynamoDB
//! tables, S3 objects).
//!
//! The traits are synchronous; every call is driven to completion on a private
//! current-thread tokio runtime.

use std::collections::HashMap;
use std::future::Future;

use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::QueueAttributeName;
use serde_json::Value;

use crate::{
    BackendError, Item, ItemKey, KeyValueTable, MessageAttributes, ObjectMetadata, ObjectStore,
    QueueService, ReceiveRequest, ReceivedMessage, ResourceKind, Result, TableSchema,
    TopicService,
};

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceededException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "RequestTimeout",
    "SlowDown",
];

const NOT_FOUND_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "ResourceNotFoundException",
    "NotFound",
    "NoSuchKey",
    "NoSuchBucket",
];

pub struct AwsBackend {
    runtime: tokio::runtime::Runtime,
    sns: aws_sdk_sns::Client,
    sqs: aws_sdk_sqs::Client,
    dynamodb: aws_sdk_dynamodb::Client,
    s3: aws_sdk_s3::Client,
}

impl AwsBackend {
    /// Build clients from the default credential/region chain (environment,
    /// profile, instance metadata).
    pub fn from_env() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| BackendError::request(format!("failed to start runtime: {err}")))?;
        let config =
            runtime.block_on(aws_config::load_defaults(aws_config::BehaviorVersion::latest()));
        Ok(Self {
            sns: aws_sdk_sns::Client::new(&config),
            sqs: aws_sdk_sqs::Client::new(&config),
            dynamodb: aws_sdk_dynamodb::Client::new(&config),
            s3: aws_sdk_s3::Client::new(&config),
            runtime,
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn queue_url(&self, name: &str) -> Result<String> {
        let output = self
            .block_on(self.sqs.get_queue_url().queue_name(name).send())
            .map_err(|err| classify(ResourceKind::Queue, name, err))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| BackendError::request(format!("no url returned for queue `{name}`")))
    }
}

fn classify<E, R>(kind: ResourceKind, name: &str, err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let transport_failure = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    );
    let code = err.code().map(str::to_string);
    let message = DisplayErrorContext(&err).to_string();

    match code.as_deref() {
        Some(code) if NOT_FOUND_CODES.contains(&code) => BackendError::not_found(kind, name),
        Some(code) if TRANSIENT_CODES.contains(&code) => BackendError::transient(message),
        _ if transport_failure => BackendError::transient(message),
        _ => BackendError::request(message),
    }
}

fn queue_name_from_url(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

impl TopicService for AwsBackend {
    fn create_topic(&self, name: &str) -> Result<String> {
        let output = self
            .block_on(self.sns.create_topic().name(name).send())
            .map_err(|err| classify(ResourceKind::Topic, name, err))?;
        output
            .topic_arn()
            .map(str::to_string)
            .ok_or_else(|| BackendError::request(format!("no arn returned for topic `{name}`")))
    }

    fn publish(
        &self,
        topic_arn: &str,
        payload: &str,
        attributes: &MessageAttributes,
    ) -> Result<String> {
        let mut request = self.sns.publish().topic_arn(topic_arn).message(payload);
        for (key, value) in attributes {
            let attribute = aws_sdk_sns::types::MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|err| BackendError::invalid(err.to_string()))?;
            request = request.message_attributes(key, attribute);
        }
        let output = self
            .block_on(request.send())
            .map_err(|err| classify(ResourceKind::Topic, topic_arn, err))?;
        Ok(output.message_id().unwrap_or_default().to_string())
    }

    fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String> {
        let output = self
            .block_on(
                self.sns
                    .subscribe()
                    .topic_arn(topic_arn)
                    .protocol(protocol)
                    .endpoint(endpoint)
                    .return_subscription_arn(true)
                    .send(),
            )
            .map_err(|err| classify(ResourceKind::Topic, topic_arn, err))?;
        Ok(output.subscription_arn().unwrap_or_default().to_string())
    }
}

impl QueueService for AwsBackend {
    fn create_queue(&self, name: &str) -> Result<String> {
        let output = self
            .block_on(self.sqs.create_queue().queue_name(name).send())
            .map_err(|err| classify(ResourceKind::Queue, name, err))?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| BackendError::request(format!("no url returned for queue `{name}`")))
    }

    fn queue_exists(&self, name: &str) -> Result<bool> {
        match self.queue_url(name) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn delete_queue(&self, name: &str) -> Result<()> {
        let url = self.queue_url(name)?;
        self.block_on(self.sqs.delete_queue().queue_url(url).send())
            .map_err(|err| classify(ResourceKind::Queue, name, err))?;
        Ok(())
    }

    fn get_arn(&self, name: &str) -> Result<String> {
        let url = self.queue_url(name)?;
        let output = self
            .block_on(
                self.sqs
                    .get_queue_attributes()
                    .queue_url(url)
                    .attribute_names(QueueAttributeName::QueueArn)
                    .send(),
            )
            .map_err(|err| classify(ResourceKind::Queue, name, err))?;
        output
            .attributes()
            .and_then(|attributes| attributes.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| BackendError::request(format!("no arn returned for queue `{name}`")))
    }

    fn receive(&self, name: &str, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        let url = self.queue_url(name)?;
        let output = self
            .block_on(
                self.sqs
                    .receive_message()
                    .queue_url(url)
                    .max_number_of_messages(request.max_messages as i32)
                    .visibility_timeout(request.visibility_timeout.as_secs() as i32)
                    .wait_time_seconds(request.wait_time.as_secs() as i32)
                    .send(),
            )
            .map_err(|err| classify(ResourceKind::Queue, name, err))?;

        Ok(output
            .messages()
            .iter()
            .filter_map(|message| {
                Some(ReceivedMessage {
                    message_id: message.message_id()?.to_string(),
                    receipt_handle: message.receipt_handle()?.to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<()> {
        let url = self.queue_url(name)?;
        self.block_on(
            self.sqs
                .delete_message()
                .queue_url(url)
                .receipt_handle(receipt_handle)
                .send(),
        )
        .map_err(|err| classify(ResourceKind::Queue, name, err))?;
        Ok(())
    }

    fn set_attributes(&self, name: &str, policy_json: &str) -> Result<()> {
        let url = self.queue_url(name)?;
        self.block_on(
            self.sqs
                .set_queue_attributes()
                .queue_url(url)
                .attributes(QueueAttributeName::Policy, policy_json)
                .send(),
        )
        .map_err(|err| classify(ResourceKind::Queue, name, err))?;
        Ok(())
    }

    fn list_queues(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .block_on(
                    self.sqs
                        .list_queues()
                        .queue_name_prefix(prefix)
                        .set_next_token(next_token.take())
                        .send(),
                )
                .map_err(|err| classify(ResourceKind::Queue, prefix, err))?;
            names.extend(
                output
                    .queue_urls()
                    .iter()
                    .map(|url| queue_name_from_url(url).to_string()),
            );
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(names)
    }
}

impl KeyValueTable for AwsBackend {
    fn get_item(&self, table: &str, key: &ItemKey) -> Result<Option<Item>> {
        let output = self
            .block_on(
                self.dynamodb
                    .get_item()
                    .table_name(table)
                    .set_key(Some(key_to_attributes(key)))
                    .consistent_read(true)
                    .send(),
            )
            .map_err(|err| classify(ResourceKind::Table, table, err))?;
        Ok(output.item().map(attributes_to_item))
    }

    fn put_item(&self, table: &str, item: Item) -> Result<()> {
        let attributes = item
            .into_iter()
            .map(|(name, value)| (name, to_attribute(value)))
            .collect::<HashMap<_, _>>();
        self.block_on(
            self.dynamodb
                .put_item()
                .table_name(table)
                .set_item(Some(attributes))
                .send(),
        )
        .map_err(|err| classify(ResourceKind::Table, table, err))?;
        Ok(())
    }

    fn delete_item(&self, table: &str, key: &ItemKey) -> Result<()> {
        self.block_on(
            self.dynamodb
                .delete_item()
                .table_name(table)
                .set_key(Some(key_to_attributes(key)))
                .send(),
        )
        .map_err(|err| classify(ResourceKind::Table, table, err))?;
        Ok(())
    }

    fn scan(&self, table: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let output = self
                .block_on(
                    self.dynamodb
                        .scan()
                        .table_name(table)
                        .set_exclusive_start_key(start_key.take())
                        .send(),
                )
                .map_err(|err| classify(ResourceKind::Table, table, err))?;
            items.extend(output.items().iter().map(attributes_to_item));
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Key attributes are declared as strings; the table uses on-demand billing.
    fn create_table(&self, schema: &TableSchema) -> Result<()> {
        let mut keys = vec![(schema.partition_key.as_str(), KeyType::Hash)];
        if let Some(sort_key) = &schema.sort_key {
            keys.push((sort_key.as_str(), KeyType::Range));
        }

        let mut request = self
            .dynamodb
            .create_table()
            .table_name(&schema.name)
            .billing_mode(BillingMode::PayPerRequest);
        for (name, key_type) in keys {
            let definition = AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|err| BackendError::invalid(err.to_string()))?;
            let element = KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|err| BackendError::invalid(err.to_string()))?;
            request = request.attribute_definitions(definition).key_schema(element);
        }

        match self.block_on(request.send()) {
            Ok(_) => {}
            Err(err) if err.code() == Some("ResourceInUseException") => {}
            Err(err) => return Err(classify(ResourceKind::Table, &schema.name, err)),
        }

        self.wait_for_active(&schema.name)
    }

    fn delete_table(&self, table: &str) -> Result<()> {
        self.block_on(self.dynamodb.delete_table().table_name(table).send())
            .map_err(|err| classify(ResourceKind::Table, table, err))?;
        Ok(())
    }
}

impl AwsBackend {
    fn wait_for_active(&self, table: &str) -> Result<()> {
        const POLL: std::time::Duration = std::time::Duration::from_secs(1);
        const ATTEMPTS: u32 = 120;

        for _ in 0..ATTEMPTS {
            let output = self
                .block_on(self.dynamodb.describe_table().table_name(table).send())
                .map_err(|err| classify(ResourceKind::Table, table, err))?;
            let status = output.table().and_then(|t| t.table_status());
            if status == Some(&TableStatus::Active) {
                return Ok(());
            }
            tracing::debug!(target = "nimbus.backend", table, ?status, "waiting for table");
            std::thread::sleep(POLL);
        }
        Err(BackendError::transient(format!(
            "table `{table}` did not become active"
        )))
    }
}

impl ObjectStore for AwsBackend {
    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let resource = format!("{bucket}/{key}");
        let output = self
            .block_on(self.s3.head_object().bucket(bucket).key(key).send())
            .map_err(|err| classify(ResourceKind::Object, &resource, err))?;
        Ok(ObjectMetadata {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            sha512: output
                .metadata()
                .and_then(|metadata| metadata.get("sha512"))
                .cloned(),
            etag: output.e_tag().map(|etag| etag.trim_matches('"').to_string()),
            last_modified_millis: output
                .last_modified()
                .and_then(|at| at.to_millis().ok())
                .map(|millis| millis.max(0) as u64),
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let resource = format!("{bucket}/{key}");
        self.block_on(async {
            let output = self
                .s3
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| classify(ResourceKind::Object, &resource, err))?;
            let bytes = output
                .body
                .collect()
                .await
                .map_err(|err| BackendError::transient(format!("failed to read {resource}: {err}")))?;
            Ok(bytes.into_bytes().to_vec())
        })
    }
}

fn key_to_attributes(key: &ItemKey) -> HashMap<String, AttributeValue> {
    let mut attributes = HashMap::new();
    attributes.insert(key.partition.name.clone(), to_attribute(key.partition.value.clone()));
    if let Some(sort) = &key.sort {
        attributes.insert(sort.name.clone(), to_attribute(sort.value.clone()));
    }
    attributes
}

fn attributes_to_item(attributes: &HashMap<String, AttributeValue>) -> Item {
    attributes
        .iter()
        .map(|(name, value)| (name.clone(), from_attribute(value)))
        .collect()
}

fn to_attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s),
        Value::Array(values) => AttributeValue::L(values.into_iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.into_iter()
                .map(|(name, value)| (name, to_attribute(value)))
                .collect(),
        ),
    }
}

/// Numbers come back as integers when they parse as such, floats otherwise.
fn from_attribute(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => parse_number(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(values) => Value::Array(values.iter().map(from_attribute).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(name, value)| (name.clone(), from_attribute(value)))
                .collect(),
        ),
        AttributeValue::Ss(values) => {
            Value::Array(values.iter().cloned().map(Value::String).collect())
        }
        AttributeValue::Ns(values) => Value::Array(values.iter().map(|n| parse_number(n)).collect()),
        AttributeValue::B(blob) => Value::String(hex::encode(blob.as_ref())),
        _ => Value::Null,
    }
}

fn parse_number(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attribute_conversion_preserves_shape() {
        let value = json!({"n": 3, "f": 1.5, "s": "x", "b": true, "l": [1, "a"], "z": null});
        assert_eq!(from_attribute(&to_attribute(value.clone())), value);
    }

    #[test]
    fn queue_name_is_last_url_segment() {
        assert_eq!(
            queue_name_from_url("https://sqs.us-west-2.amazonaws.com/123/psabc"),
            "psabc"
        );
    }
}
