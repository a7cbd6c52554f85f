use std::fmt;

pub type Result<T> = std::result::Result<T, BackendError>;

/// The kind of remote resource an error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Topic,
    Queue,
    Table,
    Item,
    Object,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Topic => "topic",
            ResourceKind::Queue => "queue",
            ResourceKind::Table => "table",
            ResourceKind::Item => "item",
            ResourceKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Errors produced by backend collaborators.
///
/// Callers branch on the variant: `Transient` is retried at the call site,
/// `NotFound` is "nothing to do" for deletes and a hard failure for reads that
/// must exist, everything else propagates.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{kind} `{name}` does not exist")]
    NotFound { kind: ResourceKind, name: String },

    #[error("transient backend error: {message}")]
    Transient { message: String },

    #[error("invalid backend request: {message}")]
    InvalidRequest { message: String },

    #[error("backend request failed: {message}")]
    Request { message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// `true` when the error reports that a resource of `kind` is missing.
    pub fn is_not_found_of(&self, kind: ResourceKind) -> bool {
        matches!(self, Self::NotFound { kind: k, .. } if *k == kind)
    }
}
