use crossbeam_channel as channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbus_backend::{
    retry_transient, MessageAttributes, QueueService, RetryPolicy, TopicService,
};
use nimbus_freshness::{FreshnessTable, SERVICE_QUEUE};
use serde::Serialize;
use serde_json::Value;

use crate::error::{PubSubError, Result};
use crate::name::{channel_name, default_node_name};
use crate::provision::{ChannelProvisioner, NodeQueue};
use crate::pump::{InboundMessage, ReceivePump, SubscriptionConfig};
use crate::reaper::{IdleResourceReaper, ReaperConfig};
use crate::signal::ActivitySignal;
use crate::work_time::WorkTimeHistory;
use crate::worker::Worker;

/// Called on the coordinator thread for every received payload.
pub type MessageCallback = Box<dyn FnMut(Value) + Send>;

#[derive(Clone, Debug, PartialEq)]
pub struct PubSubConfig {
    pub channel: String,
    pub node: String,
    pub subscription: SubscriptionConfig,
    /// Longest the loop sleeps when idle before polling again.
    pub activity_wait: Duration,
    /// How often idle queues of the channel are reaped.
    pub reap_interval: Duration,
    pub reaper: ReaperConfig,
    /// Bound on each thread join during [`PubSubCoordinator::request_exit`].
    pub join_timeout: Duration,
    /// Backoff for provisioning at startup.
    pub retry: RetryPolicy,
}

impl PubSubConfig {
    /// Defaults for `channel` on this machine (node `<computer>-<user>`).
    pub fn new(channel: impl Into<String>) -> Self {
        let subscription = SubscriptionConfig::default();
        Self {
            channel: channel.into(),
            node: default_node_name(),
            subscription,
            activity_wait: Duration::from_secs(3),
            reap_interval: Duration::from_secs(60 * 60),
            reaper: ReaperConfig::default(),
            join_timeout: subscription.wait_time() + Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(PubSubError::invalid_config("channel must not be empty"));
        }
        if self.node.is_empty() {
            return Err(PubSubError::invalid_config("node must not be empty"));
        }
        if self.activity_wait.is_zero() {
            return Err(PubSubError::invalid_config("activity wait must be positive"));
        }
        Ok(())
    }
}

/// Where received payloads go.
enum Sink {
    Callback(MessageCallback),
    Inbox(channel::Sender<Value>),
}

/// Publish/subscribe endpoint for one node on one channel.
///
/// Owns two threads: the coordinator loop, which publishes queued messages and
/// dispatches received ones, and the [`ReceivePump`]. Without a callback,
/// received payloads are buffered for [`PubSubCoordinator::get_messages`].
pub struct PubSubCoordinator {
    node_queue: NodeQueue,
    publish_tx: channel::Sender<Value>,
    inbox_rx: Option<channel::Receiver<Value>>,
    activity: Arc<ActivitySignal>,
    work_times: Arc<WorkTimeHistory>,
    stop_tx: channel::Sender<()>,
    coordinator: Option<Worker>,
    pump: Option<ReceivePump>,
    join_timeout: Duration,
}

impl PubSubCoordinator {
    /// Provision the channel for this node and start receiving.
    pub fn start(
        topics: Arc<dyn TopicService>,
        queues: Arc<dyn QueueService>,
        freshness: Arc<FreshnessTable>,
        config: PubSubConfig,
        callback: Option<MessageCallback>,
    ) -> Result<Self> {
        config.validate()?;

        let provisioner =
            ChannelProvisioner::new(topics.clone(), queues.clone(), freshness.clone());
        let node_queue = retry_transient(&config.retry, "provision", || {
            provisioner.ensure(&config.channel, &config.node)
        })?;
        tracing::info!(
            target = "nimbus.pubsub",
            channel = %config.channel,
            node = %config.node,
            queue = %node_queue.queue_name,
            "pub/sub node ready"
        );

        let activity = Arc::new(ActivitySignal::new());
        let work_times = Arc::new(WorkTimeHistory::default());
        let (publish_tx, publish_rx) = channel::unbounded();
        let (inbound_tx, inbound_rx) = channel::unbounded();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let (sink, inbox_rx) = match callback {
            Some(callback) => (Sink::Callback(callback), None),
            None => {
                let (tx, rx) = channel::unbounded();
                (Sink::Inbox(tx), Some(rx))
            }
        };

        let pump = ReceivePump::start(
            queues.clone(),
            node_queue.queue_name.clone(),
            config.subscription,
            inbound_tx,
            activity.clone(),
            work_times.clone(),
        )?;

        let state = LoopState {
            topics,
            queues: queues.clone(),
            reaper: IdleResourceReaper::new(queues, freshness.clone(), config.reaper),
            freshness,
            node_queue: node_queue.clone(),
            publish_rx,
            inbound_rx,
            stop_rx,
            sink,
            activity: activity.clone(),
            work_times: config
                .subscription
                .measures_work_time()
                .then(|| work_times.clone()),
            activity_wait: config.activity_wait,
            reap_interval: config.reap_interval,
            pending_publish: None,
        };
        let coordinator = Worker::spawn("pubsub-coordinator", move || state.run())?;

        Ok(Self {
            node_queue,
            publish_tx,
            inbox_rx,
            activity,
            work_times,
            stop_tx,
            coordinator: Some(coordinator),
            pump: Some(pump),
            join_timeout: config.join_timeout,
        })
    }

    pub fn node_queue(&self) -> &NodeQueue {
        &self.node_queue
    }

    /// Receive-to-delete times of recently processed messages. Only recorded in
    /// deferred-delete mode without an explicit visibility timeout.
    pub fn work_times(&self) -> &WorkTimeHistory {
        &self.work_times
    }

    /// Queue `message` for publishing. Backend failures never surface here; the
    /// message waits until the topic accepts it.
    pub fn publish<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let value = serde_json::to_value(message)?;
        self.publish_tx.send(value).map_err(|_| PubSubError::Closed)?;
        self.activity.set();
        Ok(())
    }

    /// Drain every payload received so far. Only available without a callback.
    pub fn get_messages(&self) -> Result<Vec<Value>> {
        match &self.inbox_rx {
            Some(inbox) => Ok(inbox.try_iter().collect()),
            None => Err(PubSubError::CallbackMode),
        }
    }

    /// Stop both threads and wait (bounded) for them to exit.
    ///
    /// Calling it again after it returned is a no-op.
    pub fn request_exit(&mut self) -> Result<()> {
        let _ = self.stop_tx.try_send(());
        self.activity.set();
        if let Some(pump) = &self.pump {
            pump.request_stop();
        }

        let coordinator = match self.coordinator.take() {
            Some(worker) => worker.join_timeout(self.join_timeout),
            None => Ok(()),
        };
        let pump = match self.pump.as_mut() {
            Some(pump) => pump.stop(self.join_timeout),
            None => Ok(()),
        };
        self.pump = None;

        coordinator.and(pump)
    }
}

impl Drop for PubSubCoordinator {
    fn drop(&mut self) {
        if self.coordinator.is_some() {
            let _ = self.stop_tx.try_send(());
            self.activity.set();
        }
    }
}

struct LoopState {
    topics: Arc<dyn TopicService>,
    queues: Arc<dyn QueueService>,
    freshness: Arc<FreshnessTable>,
    reaper: IdleResourceReaper,
    node_queue: NodeQueue,
    publish_rx: channel::Receiver<Value>,
    inbound_rx: channel::Receiver<InboundMessage>,
    stop_rx: channel::Receiver<()>,
    sink: Sink,
    activity: Arc<ActivitySignal>,
    /// Set when processing times size the visibility timeout.
    work_times: Option<Arc<WorkTimeHistory>>,
    activity_wait: Duration,
    reap_interval: Duration,
    /// Serialized message whose publish failed transiently.
    pending_publish: Option<String>,
}

impl LoopState {
    fn run(mut self) {
        let mut next_reap = Instant::now();

        loop {
            if !matches!(self.stop_rx.try_recv(), Err(channel::TryRecvError::Empty)) {
                break;
            }

            let mut worked = self.publish_one();
            worked |= self.dispatch_one();

            if Instant::now() >= next_reap {
                self.reap();
                next_reap = Instant::now() + self.reap_interval;
            }

            if !worked {
                self.activity.wait_timeout(self.activity_wait);
                self.activity.clear();
            }
        }

        if self.pending_publish.is_some() || !self.publish_rx.is_empty() {
            tracing::warn!(
                target = "nimbus.pubsub",
                unsent = self.publish_rx.len() + usize::from(self.pending_publish.is_some()),
                "coordinator stopped with unpublished messages"
            );
        }
        tracing::debug!(target = "nimbus.pubsub", "coordinator loop stopped");
    }

    /// Publish at most one message. Returns whether it was sent.
    fn publish_one(&mut self) -> bool {
        let payload = match self.pending_publish.take() {
            Some(payload) => payload,
            None => match self.publish_rx.try_recv() {
                Ok(value) => value.to_string(),
                Err(_) => return false,
            },
        };

        match self
            .topics
            .publish(&self.node_queue.topic_arn, &payload, &MessageAttributes::new())
        {
            Ok(message_id) => {
                tracing::trace!(target = "nimbus.pubsub", %message_id, "published");
                true
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    target = "nimbus.pubsub",
                    topic = %self.node_queue.topic_name,
                    error = %err,
                    "publish failed; will retry"
                );
                self.pending_publish = Some(payload);
                false
            }
            Err(err) => {
                tracing::error!(
                    target = "nimbus.pubsub",
                    topic = %self.node_queue.topic_name,
                    error = %err,
                    "publish failed; dropping message"
                );
                true
            }
        }
    }

    /// Deliver at most one received message. Returns whether one was delivered.
    fn dispatch_one(&mut self) -> bool {
        let Ok(message) = self.inbound_rx.try_recv() else {
            return false;
        };

        match &mut self.sink {
            Sink::Callback(callback) => callback(message.payload),
            Sink::Inbox(inbox) => {
                // The inbox receiver lives as long as the coordinator handle.
                let _ = inbox.send(message.payload);
            }
        }

        self.touch_queue();
        if let Some(receipt_handle) = message.receipt_handle {
            match self
                .queues
                .delete_message(&self.node_queue.queue_name, &receipt_handle)
            {
                Ok(()) => {
                    if let Some(work_times) = &self.work_times {
                        work_times.record(message.received_at.elapsed());
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "nimbus.pubsub",
                        queue = %self.node_queue.queue_name,
                        error = %err,
                        "failed to delete processed message"
                    );
                }
            }
        }
        true
    }

    fn reap(&self) {
        // Our own queue must never look idle to the reaper.
        self.touch_queue();
        let prefix = channel_name(&self.node_queue.channel);
        match self.reaper.reap(&prefix) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(target = "nimbus.pubsub", count = removed.len(), "reaped idle queues");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target = "nimbus.pubsub", error = %err, "idle queue reaping failed");
            }
        }
    }

    fn touch_queue(&self) {
        if let Err(err) = self
            .freshness
            .touch(SERVICE_QUEUE, &self.node_queue.queue_name)
        {
            tracing::warn!(
                target = "nimbus.pubsub",
                queue = %self.node_queue.queue_name,
                error = %err,
                "failed to record queue use"
            );
        }
    }
}
