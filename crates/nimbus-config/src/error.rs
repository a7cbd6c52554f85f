use std::sync::OnceLock;

use nimbus_cache::CacheError;
use nimbus_pubsub::PubSubError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: &'static str, message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Only the message: the rendered error quotes the offending source line.
        Self::Toml(redact_quoted_strings(err.message()))
    }
}

/// Replace quoted substrings so config values never end up in logs.
fn redact_quoted_strings(message: &str) -> String {
    static QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let re = QUOTED.get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*"|'(?:\\.|[^'\\])*'"#).ok());
    match re {
        Some(re) => re.replace_all(message, "\"<redacted>\"").into_owned(),
        None => message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_values_are_redacted() {
        let redacted = redact_quoted_strings(r#"invalid type: string "hunter\"2", expected a boolean"#);
        assert_eq!(redacted, r#"invalid type: string "<redacted>", expected a boolean"#);
        assert_eq!(redact_quoted_strings("no quotes"), "no quotes");
    }
}
