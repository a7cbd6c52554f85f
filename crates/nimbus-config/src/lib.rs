//! TOML configuration for the Nimbus crates and tracing initialisation.
//!
//! [`NimbusConfig`] mirrors the file layout; [`NimbusConfig::validate`] checks
//! it and turns it into the per-component config structs ([`Components`]).
//!
//! ```toml
//! [logging]
//! level = "nimbus.pubsub=debug,info"
//!
//! [cache]
//! max_absolute = "512MB"
//! max_fraction_of_free = 0.5
//!
//! [pubsub]
//! channel = "orders"
//! wait_time_secs = 20
//! ```

mod byte_size;
mod error;
mod logging;

pub use byte_size::{parse_byte_size, ByteSize};
pub use error::ConfigError;
pub use logging::{init_tracing, LoggingConfig};

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nimbus_backend::RetryPolicy;
use nimbus_cache::{CacheLimits, LruDiskCache, ScanCacheConfig, CACHE_DIR_ENV};
use nimbus_freshness::DEFAULT_TABLE_NAME;
use nimbus_pubsub::{PubSubConfig, ReaperConfig, SubscriptionConfig};
use serde::{Deserialize, Serialize};

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Subdirectory of the cache directory holding downloaded objects.
pub const OBJECT_CACHE_SUBDIR: &str = "objects";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NimbusConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub scan_cache: ScanCacheSection,
    #[serde(default)]
    pub freshness: FreshnessSection,
    #[serde(default)]
    pub pubsub: PubSubSection,
    #[serde(default)]
    pub reaper: ReaperSection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Cache root. `NIMBUS_CACHE_DIR` takes precedence when set.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub max_absolute: Option<ByteSize>,
    /// Fraction of the free space on the cache's filesystem, in `(0, 1]`.
    #[serde(default)]
    pub max_fraction_of_free: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanCacheSection {
    #[serde(default = "ScanCacheSection::default_clock_skew_allowance_secs")]
    pub clock_skew_allowance_secs: u64,
    /// Refetch snapshots older than this even when the table looks unchanged.
    #[serde(default)]
    pub cache_life_secs: Option<u64>,
}

impl ScanCacheSection {
    fn default_clock_skew_allowance_secs() -> u64 {
        nimbus_cache::DEFAULT_CLOCK_SKEW_ALLOWANCE.as_secs()
    }
}

impl Default for ScanCacheSection {
    fn default() -> Self {
        Self {
            clock_skew_allowance_secs: Self::default_clock_skew_allowance_secs(),
            cache_life_secs: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreshnessSection {
    #[serde(default = "FreshnessSection::default_table_name")]
    pub table_name: String,
}

impl FreshnessSection {
    fn default_table_name() -> String {
        DEFAULT_TABLE_NAME.to_owned()
    }
}

impl Default for FreshnessSection {
    fn default() -> Self {
        Self {
            table_name: Self::default_table_name(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PubSubSection {
    /// Channel to join. Without one, [`Components::pubsub`] is `None`.
    #[serde(default)]
    pub channel: Option<String>,
    /// Node name; defaults to `<computer>-<user>`.
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default = "PubSubSection::default_immediate_delete")]
    pub immediate_delete: bool,
    /// Only valid with `immediate_delete = false`.
    #[serde(default)]
    pub visibility_timeout_secs: Option<u64>,
    /// Floor of the visibility timeout measured from processing times; not valid
    /// together with `visibility_timeout_secs`.
    #[serde(default)]
    pub minimum_visibility_timeout_secs: u64,
    #[serde(default = "PubSubSection::default_wait_time_secs")]
    pub wait_time_secs: u64,
    #[serde(default = "PubSubSection::default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "PubSubSection::default_activity_wait_ms")]
    pub activity_wait_ms: u64,
    #[serde(default = "PubSubSection::default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Bound on each thread join at exit; defaults to the wait time plus 10 s.
    #[serde(default)]
    pub join_timeout_secs: Option<u64>,
}

impl PubSubSection {
    fn default_immediate_delete() -> bool {
        true
    }

    fn default_wait_time_secs() -> u64 {
        20
    }

    fn default_max_messages() -> u32 {
        10
    }

    fn default_activity_wait_ms() -> u64 {
        3_000
    }

    fn default_reap_interval_secs() -> u64 {
        60 * 60
    }
}

impl Default for PubSubSection {
    fn default() -> Self {
        Self {
            channel: None,
            node: None,
            immediate_delete: Self::default_immediate_delete(),
            visibility_timeout_secs: None,
            minimum_visibility_timeout_secs: 0,
            wait_time_secs: Self::default_wait_time_secs(),
            max_messages: Self::default_max_messages(),
            activity_wait_ms: Self::default_activity_wait_ms(),
            reap_interval_secs: Self::default_reap_interval_secs(),
            join_timeout_secs: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaperSection {
    #[serde(default = "ReaperSection::default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "ReaperSection::default_min_prefix_len")]
    pub min_prefix_len: usize,
}

impl ReaperSection {
    fn default_ttl_secs() -> u64 {
        ReaperConfig::default().ttl.as_secs()
    }

    fn default_min_prefix_len() -> usize {
        ReaperConfig::default().min_prefix_len
    }
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            ttl_secs: Self::default_ttl_secs(),
            min_prefix_len: Self::default_min_prefix_len(),
        }
    }
}

/// Backoff for transient backend failures, shared by every component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "RetrySection::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetrySection::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetrySection::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetrySection {
    fn default_max_attempts() -> u32 {
        RetryPolicy::default().max_attempts
    }

    fn default_initial_backoff_ms() -> u64 {
        RetryPolicy::default().initial_backoff.as_millis() as u64
    }

    fn default_max_backoff_ms() -> u64 {
        RetryPolicy::default().max_backoff.as_millis() as u64
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

/// Validated settings, ready to hand to the component constructors.
#[derive(Clone, Debug, PartialEq)]
pub struct Components {
    pub cache_dir: PathBuf,
    pub cache_limits: CacheLimits,
    pub scan_cache: ScanCacheConfig,
    pub freshness_table: String,
    pub subscription: SubscriptionConfig,
    pub reaper: ReaperConfig,
    pub retry: RetryPolicy,
    /// Present when `[pubsub] channel` is configured.
    pub pubsub: Option<PubSubConfig>,
    node: Option<String>,
    activity_wait: Duration,
    reap_interval: Duration,
    join_timeout: Option<Duration>,
}

impl Components {
    /// Object cache under `<cache_dir>/objects` with the configured limits.
    pub fn lru_cache(&self) -> LruDiskCache {
        LruDiskCache::new(self.cache_dir.join(OBJECT_CACHE_SUBDIR), self.cache_limits)
    }

    /// Pub/sub settings for `channel` using everything else from the file.
    pub fn pubsub_config(&self, channel: &str) -> PubSubConfig {
        let mut config = PubSubConfig::new(channel);
        if let Some(node) = &self.node {
            config = config.with_node(node.clone());
        }
        config.subscription = self.subscription;
        config.activity_wait = self.activity_wait;
        config.reap_interval = self.reap_interval;
        config.reaper = self.reaper;
        config.join_timeout = self
            .join_timeout
            .unwrap_or(self.subscription.wait_time() + Duration::from_secs(10));
        config.retry = self.retry;
        config
    }
}

impl NimbusConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::load_from_str(&text)?;
        tracing::debug!(target = "nimbus.config", path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn load_from_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Check ranges and build the component configs. `NIMBUS_CACHE_DIR`
    /// overrides `cache.dir`.
    pub fn validate(&self) -> Result<Components> {
        self.validate_with_env(std::env::var_os(CACHE_DIR_ENV))
    }

    fn validate_with_env(&self, cache_dir_env: Option<OsString>) -> Result<Components> {
        let cache_dir = resolve_cache_dir(cache_dir_env, self.cache.dir.as_deref());
        let cache_limits = CacheLimits::new(
            self.cache.max_absolute.map(ByteSize::as_u64),
            self.cache.max_fraction_of_free,
        )?;

        let retry = self.retry.policy()?;

        if self.scan_cache.cache_life_secs == Some(0) {
            return Err(ConfigError::invalid(
                "scan_cache.cache_life_secs",
                "must be positive when set",
            ));
        }
        let scan_cache = ScanCacheConfig {
            cache_dir: cache_dir.clone(),
            clock_skew_allowance: Duration::from_secs(self.scan_cache.clock_skew_allowance_secs),
            cache_life: self.scan_cache.cache_life_secs.map(Duration::from_secs),
            retry,
        };

        if self.freshness.table_name.trim().is_empty() {
            return Err(ConfigError::invalid("freshness.table_name", "must not be empty"));
        }

        let reaper = self.reaper.config()?;
        let pubsub = &self.pubsub;
        let subscription = SubscriptionConfig::new(
            pubsub.visibility_timeout_secs.map(Duration::from_secs),
            pubsub.immediate_delete,
        )?
        .with_minimum_visibility_timeout(Duration::from_secs(pubsub.minimum_visibility_timeout_secs))?
        .with_wait_time(Duration::from_secs(pubsub.wait_time_secs))?
        .with_max_messages(pubsub.max_messages)?;
        if pubsub.activity_wait_ms == 0 {
            return Err(ConfigError::invalid("pubsub.activity_wait_ms", "must be positive"));
        }
        if pubsub.reap_interval_secs == 0 {
            return Err(ConfigError::invalid("pubsub.reap_interval_secs", "must be positive"));
        }
        if pubsub.join_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "pubsub.join_timeout_secs",
                "must be positive when set",
            ));
        }

        let mut components = Components {
            cache_dir,
            cache_limits,
            scan_cache,
            freshness_table: self.freshness.table_name.clone(),
            subscription,
            reaper,
            retry,
            pubsub: None,
            node: pubsub.node.clone(),
            activity_wait: Duration::from_millis(pubsub.activity_wait_ms),
            reap_interval: Duration::from_secs(pubsub.reap_interval_secs),
            join_timeout: pubsub.join_timeout_secs.map(Duration::from_secs),
        };
        if let Some(channel) = &pubsub.channel {
            let config = components.pubsub_config(channel);
            config.validate()?;
            components.pubsub = Some(config);
        }
        Ok(components)
    }
}

impl ReaperSection {
    fn config(&self) -> Result<ReaperConfig> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid("reaper.ttl_secs", "must be positive"));
        }
        if self.min_prefix_len == 0 {
            return Err(ConfigError::invalid("reaper.min_prefix_len", "must be at least 1"));
        }
        Ok(ReaperConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            min_prefix_len: self.min_prefix_len,
        })
    }
}

impl RetrySection {
    fn policy(&self) -> Result<RetryPolicy> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.initial_backoff_ms",
                format!(
                    "{} exceeds retry.max_backoff_ms ({})",
                    self.initial_backoff_ms, self.max_backoff_ms
                ),
            ));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        })
    }
}

fn resolve_cache_dir(env: Option<OsString>, configured: Option<&Path>) -> PathBuf {
    match (env, configured) {
        (Some(dir), _) if !dir.is_empty() => PathBuf::from(dir),
        (_, Some(dir)) => dir.to_path_buf(),
        _ => std::env::temp_dir().join("nimbus"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides_configured_cache_dir() {
        let configured = Path::new("/srv/nimbus");
        assert_eq!(
            resolve_cache_dir(Some(OsString::from("/from/env")), Some(configured)),
            PathBuf::from("/from/env")
        );
        assert_eq!(
            resolve_cache_dir(Some(OsString::new()), Some(configured)),
            PathBuf::from("/srv/nimbus")
        );
        assert_eq!(
            resolve_cache_dir(None, None),
            std::env::temp_dir().join("nimbus")
        );
    }

    #[test]
    fn validate_uses_the_override() {
        let config = NimbusConfig::load_from_str("[cache]\ndir = \"/srv/nimbus\"\n").unwrap();
        let components = config
            .validate_with_env(Some(OsString::from("/from/env")))
            .unwrap();
        assert_eq!(components.cache_dir, PathBuf::from("/from/env"));
        assert_eq!(components.scan_cache.cache_dir, PathBuf::from("/from/env"));
    }
}
