use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nimbus_backend::{QueueService, ResourceKind};
use nimbus_freshness::{epoch_seconds, FreshnessTable, SERVICE_QUEUE};

use crate::error::{PubSubError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Queues whose last recorded use is older than this are deleted.
    pub ttl: Duration,
    /// Shortest prefix `reap` accepts.
    pub min_prefix_len: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 24 * 60 * 60),
            min_prefix_len: 2,
        }
    }
}

/// Deletes node queues nobody has used for longer than the TTL.
pub struct IdleResourceReaper {
    queues: Arc<dyn QueueService>,
    freshness: Arc<FreshnessTable>,
    config: ReaperConfig,
}

impl IdleResourceReaper {
    pub fn new(
        queues: Arc<dyn QueueService>,
        freshness: Arc<FreshnessTable>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            queues,
            freshness,
            config,
        }
    }

    /// Delete idle queues whose name starts with `prefix`; returns the deleted names.
    ///
    /// A queue with no freshness record at all counts as idle. Per-queue failures
    /// are logged and the queue is left for the next pass.
    pub fn reap(&self, prefix: &str) -> Result<Vec<String>> {
        if prefix.chars().count() < self.config.min_prefix_len {
            return Err(PubSubError::PrefixTooShort {
                prefix: prefix.to_string(),
                min_len: self.config.min_prefix_len,
            });
        }

        let now = epoch_seconds(SystemTime::now());
        let ttl = self.config.ttl.as_secs_f64();
        let mut removed = Vec::new();

        for queue in self.queues.list_queues(prefix)? {
            // Backends may match prefixes loosely; never act outside the prefix.
            if !queue.starts_with(prefix) {
                continue;
            }

            let mtime = match self.freshness.get_mtime(SERVICE_QUEUE, &queue) {
                Ok(mtime) => mtime,
                Err(err) => {
                    tracing::warn!(
                        target = "nimbus.pubsub",
                        queue = %queue,
                        error = %err,
                        "failed to read queue freshness; skipping"
                    );
                    continue;
                }
            };
            if mtime.is_some_and(|mtime| now - mtime <= ttl) {
                continue;
            }

            match self.queues.delete_queue(&queue) {
                Ok(()) => {
                    tracing::info!(
                        target = "nimbus.pubsub",
                        queue = %queue,
                        last_used = ?mtime,
                        "deleted idle queue"
                    );
                    removed.push(queue);
                }
                Err(err) if err.is_not_found_of(ResourceKind::Queue) => removed.push(queue),
                Err(err) => {
                    tracing::warn!(
                        target = "nimbus.pubsub",
                        queue = %queue,
                        error = %err,
                        "failed to delete idle queue; skipping"
                    );
                }
            }
        }

        Ok(removed)
    }
}
