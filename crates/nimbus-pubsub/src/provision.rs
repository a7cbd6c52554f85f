use std::sync::Arc;

use nimbus_backend::{QueueService, TopicService};
use nimbus_freshness::{FreshnessTable, SERVICE_QUEUE};
use serde_json::json;

use crate::error::Result;
use crate::name::{channel_name, queue_name};

/// A node's queue on a channel, wired to the channel's topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeQueue {
    pub channel: String,
    pub node: String,
    pub topic_name: String,
    pub topic_arn: String,
    pub queue_name: String,
    pub queue_arn: String,
    /// The queue did not exist before this provisioning.
    pub created: bool,
}

/// Creates topics and per-node queues and keeps them wired together.
pub struct ChannelProvisioner {
    topics: Arc<dyn TopicService>,
    queues: Arc<dyn QueueService>,
    freshness: Arc<FreshnessTable>,
}

impl ChannelProvisioner {
    pub fn new(
        topics: Arc<dyn TopicService>,
        queues: Arc<dyn QueueService>,
        freshness: Arc<FreshnessTable>,
    ) -> Self {
        Self {
            topics,
            queues,
            freshness,
        }
    }

    /// Record the node's queue as used, then make sure the channel's topic and
    /// the queue exist and that the queue is subscribed to the topic and accepts
    /// deliveries from it.
    ///
    /// Every step is idempotent, so a failed call can simply be repeated.
    pub fn ensure(&self, channel: &str, node: &str) -> Result<NodeQueue> {
        let topic_name = channel_name(channel);
        let queue_name = queue_name(channel, node);

        let topic_arn = self.topics.create_topic(&topic_name)?;
        // Recorded before the queue exists so a concurrent reaper never sees a
        // new queue without a freshness record.
        self.freshness.touch(SERVICE_QUEUE, &queue_name)?;

        let created = !self.queues.queue_exists(&queue_name)?;
        if created {
            self.queues.create_queue(&queue_name)?;
            tracing::info!(
                target = "nimbus.pubsub",
                channel,
                node,
                queue = %queue_name,
                "created node queue"
            );
        }
        let queue_arn = self.queues.get_arn(&queue_name)?;

        // Wiring is repeated for existing queues as well: an earlier attempt may
        // have created the queue and then failed before subscribing it.
        self.topics.subscribe(&topic_arn, "sqs", &queue_arn)?;
        self.queues
            .set_attributes(&queue_name, &delivery_policy(&queue_arn, &topic_arn))?;

        Ok(NodeQueue {
            channel: channel.to_string(),
            node: node.to_string(),
            topic_name,
            topic_arn,
            queue_name,
            queue_arn,
            created,
        })
    }
}

/// Queue access policy allowing `sqs:SendMessage` only from `topic_arn`.
pub fn delivery_policy(queue_arn: &str, topic_arn: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Id": format!("{queue_arn}/SQSDefaultPolicy"),
        "Statement": [{
            "Sid": "Allow-SNS-SendMessage",
            "Effect": "Allow",
            "Principal": {"Service": "sns.amazonaws.com"},
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": {"ArnEquals": {"aws:SourceArn": topic_arn}},
        }],
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_backend::{MemoryBackend, MemoryFault, MessageAttributes, ReceiveRequest};
    use std::time::Duration;

    fn no_wait() -> ReceiveRequest {
        ReceiveRequest {
            wait_time: Duration::ZERO,
            ..ReceiveRequest::default()
        }
    }

    fn provisioner(backend: &Arc<MemoryBackend>) -> (ChannelProvisioner, Arc<FreshnessTable>) {
        let freshness = Arc::new(FreshnessTable::new(backend.clone()));
        (
            ChannelProvisioner::new(backend.clone(), backend.clone(), freshness.clone()),
            freshness,
        )
    }

    #[test]
    fn ensure_wires_queue_to_topic() {
        let backend = Arc::new(MemoryBackend::new());
        let (provisioner, freshness) = provisioner(&backend);

        let node = provisioner.ensure("orders", "host-a").unwrap();
        assert!(node.created);
        assert_eq!(node.queue_name, queue_name("orders", "host-a"));
        assert!(freshness
            .get_mtime(SERVICE_QUEUE, &node.queue_name)
            .unwrap()
            .is_some());

        backend
            .publish(&node.topic_arn, "{}", &MessageAttributes::new())
            .unwrap();
        assert_eq!(backend.receive(&node.queue_name, &no_wait()).unwrap().len(), 1);
    }

    #[test]
    fn ensure_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let (provisioner, _) = provisioner(&backend);

        let first = provisioner.ensure("orders", "host-a").unwrap();
        let second = provisioner.ensure("orders", "host-a").unwrap();
        assert!(!second.created);
        assert_eq!(first.queue_arn, second.queue_arn);

        backend
            .publish(&first.topic_arn, "{}", &MessageAttributes::new())
            .unwrap();
        assert_eq!(backend.receive(&first.queue_name, &no_wait()).unwrap().len(), 1);
    }

    #[test]
    fn retrying_after_a_failed_policy_update_completes_the_wiring() {
        let backend = Arc::new(MemoryBackend::new());
        let (provisioner, _) = provisioner(&backend);

        backend.inject_transient_failures(MemoryFault::SetQueueAttributes, 1);
        assert!(provisioner.ensure("orders", "host-a").is_err());

        let node = provisioner.ensure("orders", "host-a").unwrap();
        assert!(!node.created);
        backend
            .publish(&node.topic_arn, "{}", &MessageAttributes::new())
            .unwrap();
        assert_eq!(backend.receive(&node.queue_name, &no_wait()).unwrap().len(), 1);
    }
}
