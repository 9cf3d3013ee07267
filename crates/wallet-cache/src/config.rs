use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for wallet-cache and the services embedding it.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "wallet_cache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Capacity of the in-memory [`MemoryCache`](crate::caching::MemoryCache).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum number of session dependent entries.
    ///
    /// These entries are dropped on session boundaries, like a wallet logout.
    ///
    /// Defaults to `10_000`.
    pub session_capacity: u64,

    /// Maximum number of entries that survive session boundaries.
    ///
    /// Defaults to `10_000`.
    pub persistent_capacity: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            session_capacity: 10_000,
            persistent_capacity: 10_000,
        }
    }
}

/// Bounds how long a caller waits for a lock held by somebody else.
///
/// The worst-case wait is `max_polls × poll_interval`, see [`wait_budget`](Self::wait_budget).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Number of wait intervals a caller tolerates.
    pub max_polls: u32,
    /// Length of a single wait interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl LockManagerConfig {
    /// The total time a waiter is allowed to wait before giving up.
    pub fn wait_budget(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_polls)
    }
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            max_polls: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration of a single [`CacheAndLockResolver`](crate::resolver::CacheAndLockResolver).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Name of the resolver, only used in logs and metrics.
    pub bio: String,

    /// How long a cached value is considered fresh.
    ///
    /// `None` (or `0s`) means cached values never expire.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Option<Duration>,

    /// Whether expired values are evicted by the cache itself.
    ///
    /// When disabled, the resolver tracks staleness on its own and keeps expired values around,
    /// handing them out as a fallback when no fresh value can be obtained.
    pub remove_expired_cache_automatically: bool,

    /// How many wait intervals a caller spends waiting for an already running request.
    pub max_wait_attempts: u32,

    /// Length of a single wait interval for an already running request.
    #[serde(with = "humantime_serde")]
    pub wait_attempt_interval: Duration,
}

impl ResolverConfig {
    /// Creates a configuration with default values and the given `bio`.
    pub fn new(bio: impl Into<String>) -> Self {
        Self {
            bio: bio.into(),
            ..Default::default()
        }
    }

    /// The lock manager settings derived from the wait settings.
    pub fn lock_manager(&self) -> LockManagerConfig {
        LockManagerConfig {
            max_polls: self.max_wait_attempts,
            poll_interval: self.wait_attempt_interval,
        }
    }

    /// The total time a caller waits for an already running request.
    pub fn wait_budget(&self) -> Duration {
        self.lock_manager().wait_budget()
    }

    /// The configured TTL, with a zero TTL meaning "never expires".
    pub fn effective_cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl.filter(|ttl| !ttl.is_zero())
    }

    /// Checks the relation between the cache TTL and the wait interval.
    ///
    /// A value that is tracked by the resolver itself has to stay fresh for at least two wait
    /// intervals, otherwise it may expire while another caller is still waiting for it and trigger
    /// a pointless refresh cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ttl) = self.effective_cache_ttl() {
            let min_ttl = self.wait_attempt_interval.saturating_mul(2);
            if !self.remove_expired_cache_automatically && ttl < min_ttl {
                return Err(ConfigError::TtlTooShort {
                    bio: self.bio.clone(),
                    ttl,
                    min_ttl,
                });
            }
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            bio: String::new(),
            cache_ttl: None,
            remove_expired_cache_automatically: true,
            max_wait_attempts: 100,
            wait_attempt_interval: Duration::from_secs(1),
        }
    }
}

/// An invalid resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error(
        "cache ttl of resolver {bio:?} is {ttl:?}, but must be at least {min_ttl:?} when expired values are kept"
    )]
    TtlTooShort {
        bio: String,
        ttl: Duration,
        min_ttl: Duration,
    },
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Capacity of the in-memory cache.
    pub cache: MemoryCacheConfig,

    /// Named resolvers, like `balances` or `fees`.
    pub resolvers: BTreeMap<String, ResolverConfig>,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Returns the configuration of the resolver called `name`.
    ///
    /// Falls back to the defaults if no such resolver is configured. The `bio` is always `name`.
    pub fn resolver(&self, name: &str) -> ResolverConfig {
        let mut config = self.resolvers.get(name).cloned().unwrap_or_default();
        config.bio = name.to_owned();
        config
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
