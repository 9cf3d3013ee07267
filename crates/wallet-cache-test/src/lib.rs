//! Helpers for testing resolvers and the lock manager.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Count the work that is actually done with a [`CountingFetcher`] instead of asserting on
//!    logs. Deduplication is about how often the expensive call runs, not about who logged what.
//!
//!  - When using [`tempdir`], hold on to the returned handle for the entire test, otherwise the
//!    directory is deleted right away.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use wallet_cache::caching::MemoryCache;
use wallet_cache::config::{MemoryCacheConfig, ResolverConfig};
use wallet_cache::resolver::CacheAndLockResolver;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `wallet_cache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("wallet_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to `name` inside `dir` and returns the full path.
pub fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Creates a small in-memory cache for a single test.
pub fn memory_cache<V>() -> Arc<MemoryCache<V>>
where
    V: Clone + Send + Sync + 'static,
{
    Arc::new(MemoryCache::new(&MemoryCacheConfig {
        session_capacity: 100,
        persistent_capacity: 100,
    }))
}

/// Creates a resolver for `String` values on top of a fresh [`memory_cache`].
///
/// # Panics
///
/// Panics if `config` is invalid.
pub fn resolver(config: ResolverConfig) -> CacheAndLockResolver<String> {
    CacheAndLockResolver::new(config, memory_cache()).unwrap()
}

/// A resolver config with a short wait budget, so that tests don't hang for minutes.
///
/// The budget is `attempts × 100ms`.
pub fn quick_config(bio: &str, attempts: u32) -> ResolverConfig {
    ResolverConfig {
        max_wait_attempts: attempts,
        wait_attempt_interval: Duration::from_millis(100),
        ..ResolverConfig::new(bio)
    }
}

/// The error of a failed [`CountingFetcher::fetch`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("upstream failed to produce {key:?}")]
pub struct FetchError {
    pub key: String,
}

/// Stands in for an expensive upstream call, like a balance lookup on a blockchain node.
///
/// Every call to [`fetch`](Self::fetch) counts as one computation, takes `latency` and returns
/// the key together with the number of the computation, so that tests can tell refreshes apart.
#[derive(Debug, Default)]
pub struct CountingFetcher {
    latency: Duration,
    computations: AtomicUsize,
    pending_failures: AtomicUsize,
}

impl CountingFetcher {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    /// Makes the next `count` calls fail after their latency passed.
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::Relaxed);
    }

    /// The number of computations started so far.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    pub async fn fetch(&self, key: &str) -> Result<String, FetchError> {
        let computation = self.computations.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        let failed = self
            .pending_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(FetchError {
                key: key.to_owned(),
            });
        }
        Ok(format!("{key}#{computation}"))
    }
}
