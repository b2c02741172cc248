//! Engine configuration, read from TOML.

use std::{path::Path, time::Duration};

use murmur_base::{RelayUrl, SecretKey};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::{engine::EngineOptions, pool::PoolOptions, worker::WorkerOptions};

/// Errors loading a [`Config`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("unable to read config {}", path.display()))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
        backtrace: Option<Backtrace>,
    },
    #[snafu(display("config must be valid toml"))]
    Parse {
        source: toml::de::Error,
        backtrace: Option<Backtrace>,
    },
}

/// Configuration of an [`Engine`](crate::Engine).
///
/// Every field has a default, an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Relays used when no relays are given explicitly.
    #[serde(default)]
    pub relays: Vec<RelayUrl>,
    /// The local identity.
    ///
    /// Without a secret key the engine runs read-only.
    #[serde(default)]
    pub secret_key: Option<SecretKey>,
    /// Maximum number of entities in each bounded cache.
    #[serde(default = "cfg_defaults::cache_capacity")]
    pub cache_capacity: usize,
    /// Maximum number of records dispatched per tick.
    #[serde(default = "cfg_defaults::batch_size")]
    pub batch_size: usize,
    /// Delay between a record arriving and its tick, in milliseconds.
    #[serde(default = "cfg_defaults::batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Connections without subscriptions are closed after this many seconds.
    #[serde(default = "cfg_defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Connections with a quality below this are reported as degraded.
    #[serde(default = "cfg_defaults::quality_threshold")]
    pub quality_threshold: f64,
    /// Timeout of one-shot count and load queries, in milliseconds.
    #[serde(default = "cfg_defaults::count_timeout_ms")]
    pub count_timeout_ms: u64,
    /// Time relays have to acknowledge a published record, in milliseconds.
    #[serde(default = "cfg_defaults::publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Records created more than this many seconds in the future are dropped.
    #[serde(default = "cfg_defaults::max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
    /// Whether ids and signatures of received records are verified.
    #[serde(default = "cfg_defaults::verify_signatures")]
    pub verify_signatures: bool,
    /// Number of dispatched record ids remembered to skip repeated records.
    #[serde(default = "cfg_defaults::dedupe_capacity")]
    pub dedupe_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            secret_key: None,
            cache_capacity: cfg_defaults::cache_capacity(),
            batch_size: cfg_defaults::batch_size(),
            batch_delay_ms: cfg_defaults::batch_delay_ms(),
            idle_timeout_secs: cfg_defaults::idle_timeout_secs(),
            quality_threshold: cfg_defaults::quality_threshold(),
            count_timeout_ms: cfg_defaults::count_timeout_ms(),
            publish_timeout_ms: cfg_defaults::publish_timeout_ms(),
            max_clock_skew_secs: cfg_defaults::max_clock_skew_secs(),
            verify_signatures: cfg_defaults::verify_signatures(),
            dedupe_capacity: cfg_defaults::dedupe_capacity(),
        }
    }
}

/// Defaults for fields from [`Config`].
mod cfg_defaults {
    pub(crate) fn cache_capacity() -> usize {
        crate::cache::DEFAULT_CACHE_CAPACITY
    }

    pub(crate) fn batch_size() -> usize {
        crate::worker::DEFAULT_BATCH_SIZE
    }

    pub(crate) fn batch_delay_ms() -> u64 {
        50
    }

    pub(crate) fn idle_timeout_secs() -> u64 {
        60
    }

    pub(crate) fn quality_threshold() -> f64 {
        murmur_relay::defaults::DEFAULT_DEGRADED_THRESHOLD
    }

    pub(crate) fn count_timeout_ms() -> u64 {
        3000
    }

    pub(crate) fn publish_timeout_ms() -> u64 {
        10_000
    }

    pub(crate) fn max_clock_skew_secs() -> u64 {
        900
    }

    pub(crate) fn verify_signatures() -> bool {
        true
    }

    pub(crate) fn dedupe_capacity() -> usize {
        10_000
    }
}

impl Config {
    /// Parses a configuration from TOML.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> Result<Self, ConfigError> {
        toml::from_str(config).context(ParseSnafu)
    }

    /// Reads a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        Self::from_str(&config)
    }

    /// The engine options described by this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        let pool = PoolOptions {
            verify_signatures: self.verify_signatures,
            max_clock_skew: Duration::from_secs(self.max_clock_skew_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            quality_threshold: self.quality_threshold,
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            ..Default::default()
        };
        EngineOptions {
            relays: self.relays.clone(),
            cache_capacity: self.cache_capacity,
            worker: WorkerOptions {
                batch_size: self.batch_size,
                delay: Duration::from_millis(self.batch_delay_ms),
            },
            pool,
            query_timeout: Duration::from_millis(self.count_timeout_ms),
            dedupe_capacity: self.dedupe_capacity,
            ..Default::default()
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        config.engine_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = Config::from_str("").unwrap();
        assert!(config.relays.is_empty());
        assert!(config.secret_key.is_none());
        assert_eq!(config.cache_capacity, 5000);
        assert_eq!(config.batch_size, 50);
        assert!(config.verify_signatures);
    }

    #[test]
    fn test_parse_config() {
        let config = Config::from_str(
            r#"
            relays = ["wss://relay.example.com", "wss://nos.example.org"]
            secret_key = "0101010101010101010101010101010101010101010101010101010101010101"
            cache_capacity = 100
            batch_delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.relays.len(), 2);
        assert_eq!(
            config.secret_key.as_ref().map(SecretKey::public),
            Some(SecretKey::from_bytes(&[1u8; 32]).public())
        );

        let options = config.engine_options();
        assert_eq!(options.cache_capacity, 100);
        assert_eq!(options.worker.delay, Duration::from_millis(10));
        assert_eq!(options.pool.idle_timeout, Duration::from_secs(60));
        assert_eq!(options.query_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(matches!(
            Config::from_str("cache_size = 10"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Config::load("/nonexistent/murmur.toml").await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
