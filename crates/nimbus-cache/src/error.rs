use nimbus_backend::BackendError;
use nimbus_freshness::FreshnessError;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the local caches.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Freshness(#[from] FreshnessError),

    #[error("invalid cache limits: {message}")]
    InvalidLimits { message: String },

    #[error("invalid cache key {key:?}")]
    InvalidKey { key: String },

    #[error("content hash mismatch for {object}: expected {expected}, found {found}")]
    ContentHashMismatch {
        object: String,
        expected: String,
        found: String,
    },
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Snapshots hold arbitrary table data; keep item values out of error messages.
        Self::Json {
            message: redact_quoted(&err.to_string()),
        }
    }
}

fn redact_quoted(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut inside = false;
    let mut escaped = false;
    for ch in message.chars() {
        if inside {
            match ch {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    out.push_str("<redacted>\"");
                    inside = false;
                }
                _ => escaped = false,
            }
            continue;
        }
        out.push(ch);
        if ch == '"' {
            inside = true;
        }
    }
    if inside {
        out.push_str("<redacted>");
    }
    out
}
