use std::time::Duration;

use nimbus_backend::{BackendError, RetryableError};
use nimbus_freshness::FreshnessError;

pub type Result<T> = std::result::Result<T, PubSubError>;

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Freshness(#[from] FreshnessError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pub/sub configuration: {message}")]
    InvalidConfig { message: String },

    #[error("refusing to reap with prefix {prefix:?}: at least {min_len} characters required")]
    PrefixTooShort { prefix: String, min_len: usize },

    #[error("messages are delivered to the subscription callback; there is nothing to poll")]
    CallbackMode,

    #[error("the pub/sub coordinator has shut down")]
    Closed,

    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        worker: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{worker} thread did not exit within {timeout:?}")]
    JoinTimeout {
        worker: &'static str,
        timeout: Duration,
    },

    #[error("{worker} thread panicked: {message}")]
    WorkerPanicked {
        worker: &'static str,
        message: String,
    },
}

impl PubSubError {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl RetryableError for PubSubError {
    fn is_transient(&self) -> bool {
        match self {
            PubSubError::Backend(err) => err.is_transient(),
            PubSubError::Freshness(err) => err.is_transient(),
            _ => false,
        }
    }
}
