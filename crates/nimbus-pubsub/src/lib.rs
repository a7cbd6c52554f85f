//! Publish/subscribe over a topic service and per-node queues.
//!
//! Each node on a channel gets its own queue subscribed to the channel's topic.
//! [`PubSubCoordinator`] provisions the pair, runs a background receive pump and
//! a dispatch loop, and periodically deletes queues of nodes that have been gone
//! for a long time ([`IdleResourceReaper`]). Names are derived with [`sanitize`]
//! so arbitrary channel and node strings map onto legal backend names.

mod coordinator;
mod error;
mod name;
mod provision;
mod pump;
mod reaper;
mod signal;
mod work_time;
mod worker;

pub use coordinator::{MessageCallback, PubSubConfig, PubSubCoordinator};
pub use error::{PubSubError, Result};
pub use name::{
    channel_name, default_node_name, queue_name, sanitize, PUBSUB_PREFIX, SANITIZED_LEN,
};
pub use provision::{delivery_policy, ChannelProvisioner, NodeQueue};
pub use pump::{InboundMessage, ReceivePump, SubscriptionConfig};
pub use reaper::{IdleResourceReaper, ReaperConfig};
pub use signal::ActivitySignal;
pub use work_time::{WorkTimeHistory, DEFAULT_WORK_TIME_SAMPLES};
