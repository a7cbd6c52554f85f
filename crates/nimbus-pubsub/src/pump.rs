use crossbeam_channel as channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbus_backend::{
    QueueService, ReceiveRequest, ReceivedMessage, TopicNotification, MAX_RECEIVE_BATCH,
    MAX_RECEIVE_WAIT,
};
use serde_json::Value;

use crate::error::{PubSubError, Result};
use crate::signal::ActivitySignal;
use crate::work_time::WorkTimeHistory;
use crate::worker::Worker;

/// How a node receives from its queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionConfig {
    visibility_timeout: Option<Duration>,
    minimum_visibility_timeout: Duration,
    immediate_delete: bool,
    wait_time: Duration,
    max_messages: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: None,
            minimum_visibility_timeout: Duration::ZERO,
            immediate_delete: true,
            wait_time: MAX_RECEIVE_WAIT,
            max_messages: MAX_RECEIVE_BATCH,
        }
    }
}

impl SubscriptionConfig {
    /// Visibility timeout used when messages are deleted as soon as they are received.
    pub const IMMEDIATE_DELETE_VISIBILITY: Duration = Duration::from_secs(30);
    /// Deferred-delete visibility timeout before any processing time was measured.
    pub const DEFAULT_VISIBILITY: Duration = Duration::from_secs(300);
    /// Measured processing times are scaled by this to get the visibility timeout.
    pub const WORK_TIME_MULTIPLIER: u32 = 10;
    /// Processing times below this are counted as this.
    pub const MINIMUM_WORK_TIME: Duration = Duration::from_secs(1);
    /// Longest visibility timeout the queue service accepts.
    pub const MAX_VISIBILITY: Duration = Duration::from_secs(12 * 60 * 60);

    /// An explicit `visibility_timeout` only makes sense when messages stay on the
    /// queue until processed, so combining it with `immediate_delete` is rejected.
    pub fn new(visibility_timeout: Option<Duration>, immediate_delete: bool) -> Result<Self> {
        if visibility_timeout.is_some() && immediate_delete {
            return Err(PubSubError::invalid_config(
                "an explicit visibility timeout together with immediate delete is nonsensical",
            ));
        }
        if visibility_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(PubSubError::invalid_config("visibility timeout must be positive"));
        }
        Ok(Self {
            visibility_timeout,
            immediate_delete,
            ..Self::default()
        })
    }

    /// Floor of the measured visibility timeout in deferred-delete mode. Cannot
    /// be combined with an explicit visibility timeout.
    pub fn with_minimum_visibility_timeout(mut self, minimum: Duration) -> Result<Self> {
        if self.visibility_timeout.is_some() && !minimum.is_zero() {
            return Err(PubSubError::invalid_config(
                "give either a visibility timeout or a minimum visibility timeout, not both",
            ));
        }
        self.minimum_visibility_timeout = minimum;
        Ok(self)
    }

    /// Long-poll wait per receive call, at most 20 s.
    pub fn with_wait_time(mut self, wait_time: Duration) -> Result<Self> {
        if wait_time > MAX_RECEIVE_WAIT {
            return Err(PubSubError::invalid_config(format!(
                "wait time must be at most {MAX_RECEIVE_WAIT:?}, got {wait_time:?}"
            )));
        }
        self.wait_time = wait_time;
        Ok(self)
    }

    pub fn with_max_messages(mut self, max_messages: u32) -> Result<Self> {
        if !(1..=MAX_RECEIVE_BATCH).contains(&max_messages) {
            return Err(PubSubError::invalid_config(format!(
                "max messages must be within 1..={MAX_RECEIVE_BATCH}, got {max_messages}"
            )));
        }
        self.max_messages = max_messages;
        Ok(self)
    }

    pub fn immediate_delete(&self) -> bool {
        self.immediate_delete
    }

    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    pub fn minimum_visibility_timeout(&self) -> Duration {
        self.minimum_visibility_timeout
    }

    /// Whether processing times should be measured: messages stay on the queue
    /// until processed and no explicit timeout was given.
    pub fn measures_work_time(&self) -> bool {
        !self.immediate_delete && self.visibility_timeout.is_none()
    }

    /// Visibility timeout before any processing time was measured.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout_for(None)
    }

    /// Visibility timeout given the median measured processing time.
    ///
    /// In deferred-delete mode without an explicit timeout this is
    /// `WORK_TIME_MULTIPLIER` times the median (itself at least
    /// `MINIMUM_WORK_TIME`), rounded to whole seconds and never below the
    /// configured minimum.
    pub fn visibility_timeout_for(&self, median_work_time: Option<Duration>) -> Duration {
        match (self.visibility_timeout, self.immediate_delete) {
            (Some(timeout), _) => timeout,
            (None, true) => Self::IMMEDIATE_DELETE_VISIBILITY,
            (None, false) => {
                let measured = match median_work_time {
                    Some(median) => {
                        let scaled = median.max(Self::MINIMUM_WORK_TIME) * Self::WORK_TIME_MULTIPLIER;
                        Duration::from_secs(scaled.as_secs_f64().round() as u64)
                    }
                    None => Self::DEFAULT_VISIBILITY,
                };
                measured
                    .max(self.minimum_visibility_timeout)
                    .min(Self::MAX_VISIBILITY)
            }
        }
    }

    pub fn receive_request(&self, work_times: &WorkTimeHistory) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: self.max_messages,
            visibility_timeout: self.visibility_timeout_for(work_times.median()),
            wait_time: self.wait_time,
        }
    }
}

/// A decoded delivery handed from the pump to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub payload: Value,
    /// Present when the message is still on the queue and must be deleted once
    /// processed.
    pub receipt_handle: Option<String>,
    pub received_at: Instant,
}

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Background long-poll receiver bound to one queue.
///
/// Shutdown is checked once per receive, so stopping takes at most one wait time.
pub struct ReceivePump {
    stop_tx: channel::Sender<()>,
    worker: Option<Worker>,
}

impl ReceivePump {
    pub fn start(
        queues: Arc<dyn QueueService>,
        queue_name: String,
        config: SubscriptionConfig,
        inbound: channel::Sender<InboundMessage>,
        activity: Arc<ActivitySignal>,
        work_times: Arc<WorkTimeHistory>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let state = PumpState {
            queues,
            queue_name,
            config,
            inbound,
            activity,
            work_times,
            stop_rx,
        };
        let worker = Worker::spawn("receive-pump", move || state.run())?;
        Ok(Self {
            stop_tx,
            worker: Some(worker),
        })
    }

    /// Ask the pump to exit after its current receive.
    pub fn request_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Request a stop and wait up to `timeout` for the thread to exit.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.request_stop();
        match self.worker.take() {
            Some(worker) => worker.join_timeout(timeout),
            None => Ok(()),
        }
    }
}

impl Drop for ReceivePump {
    fn drop(&mut self) {
        // Never block here; the thread exits on its own after the current poll.
        self.request_stop();
    }
}

struct PumpState {
    queues: Arc<dyn QueueService>,
    queue_name: String,
    config: SubscriptionConfig,
    inbound: channel::Sender<InboundMessage>,
    activity: Arc<ActivitySignal>,
    work_times: Arc<WorkTimeHistory>,
    stop_rx: channel::Receiver<()>,
}

impl PumpState {
    fn run(self) {
        tracing::debug!(
            target = "nimbus.pubsub",
            queue = %self.queue_name,
            immediate_delete = self.config.immediate_delete(),
            "receive pump started"
        );

        while !self.stop_requested() {
            let request = self.config.receive_request(&self.work_times);
            let messages = match self.queues.receive(&self.queue_name, &request) {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(
                        target = "nimbus.pubsub",
                        queue = %self.queue_name,
                        error = %err,
                        "receive failed; backing off"
                    );
                    if self.backoff() {
                        break;
                    }
                    continue;
                }
            };

            let received = messages.len();
            for (forwarded, message) in messages.into_iter().enumerate() {
                if !self.forward(message) {
                    // Unforwarded messages reappear after their visibility timeout.
                    tracing::debug!(
                        target = "nimbus.pubsub",
                        queue = %self.queue_name,
                        abandoned = received - forwarded,
                        "coordinator is gone; stopping receive pump"
                    );
                    return;
                }
            }
        }

        tracing::debug!(target = "nimbus.pubsub", queue = %self.queue_name, "receive pump stopped");
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop_rx.try_recv(), Err(channel::TryRecvError::Empty))
    }

    /// Sleep for the error backoff; returns `true` if a stop arrived meanwhile.
    fn backoff(&self) -> bool {
        !matches!(
            self.stop_rx.recv_timeout(ERROR_BACKOFF),
            Err(channel::RecvTimeoutError::Timeout)
        )
    }

    /// Returns `false` once the receiving side of the hand-off queue is gone.
    fn forward(&self, message: ReceivedMessage) -> bool {
        let received_at = Instant::now();
        let payload = match decode(&message.body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    target = "nimbus.pubsub",
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    error = %err,
                    "dropping undecodable message"
                );
                self.delete(&message);
                return true;
            }
        };

        let receipt_handle = if self.config.immediate_delete() {
            None
        } else {
            Some(message.receipt_handle.clone())
        };
        if self
            .inbound
            .send(InboundMessage {
                payload,
                receipt_handle,
                received_at,
            })
            .is_err()
        {
            return false;
        }
        self.activity.set();

        if self.config.immediate_delete() {
            self.delete(&message);
        }
        true
    }

    fn delete(&self, message: &ReceivedMessage) {
        if let Err(err) = self
            .queues
            .delete_message(&self.queue_name, &message.receipt_handle)
        {
            tracing::warn!(
                target = "nimbus.pubsub",
                queue = %self.queue_name,
                message_id = %message.message_id,
                error = %err,
                "failed to delete message"
            );
        }
    }
}

/// Unwrap the topic envelope and parse the published payload.
fn decode(body: &str) -> std::result::Result<Value, serde_json::Error> {
    let notification: TopicNotification = serde_json::from_str(body)?;
    serde_json::from_str(&notification.message)
}
