use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use wallet_cache::resolver::{CacheAndLockResolver, ResolverError};
use wallet_cache_test::{CountingFetcher, FetchError};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of requests in flight at any time.
    pub concurrency: usize,
    /// Name of the resolver config to use.
    #[serde(default = "default_resolver")]
    pub resolver: String,
    /// Number of distinct keys the requests are spread over.
    pub keys: usize,
    /// How long a single refresh takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Fraction of refreshes that fail, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default)]
    pub session_dependent: bool,
}

fn default_resolver() -> String {
    "balances".into()
}

/// A workload, ready to run against its resolver.
pub struct ParsedWorkload {
    pub concurrency: usize,
    pub keys: Vec<String>,
    pub failure_rate: f64,
    pub session_dependent: bool,
    pub resolver: Arc<CacheAndLockResolver<String>>,
    pub fetcher: CountingFetcher,
}

/// Clamps `rate` to a probability. `NaN` means no failures.
fn failure_probability(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}

pub fn prepare_workload(
    index: usize,
    workload: Workload,
    resolver: Arc<CacheAndLockResolver<String>>,
) -> ParsedWorkload {
    // workloads may share a resolver, so keep their keys apart
    let keys = (0..workload.keys.max(1))
        .map(|key| format!("workload{index}_{}_{key}", workload.resolver))
        .collect();

    ParsedWorkload {
        concurrency: workload.concurrency,
        keys,
        failure_rate: failure_probability(workload.failure_rate),
        session_dependent: workload.session_dependent,
        resolver,
        fetcher: CountingFetcher::new(workload.latency),
    }
}

/// Resolves a random key of `workload`, refreshing it if needed.
pub async fn process_workload(workload: &ParsedWorkload) -> Result<Option<String>, ResolverError> {
    let (key, fail) = {
        let mut rng = rand::rng();
        let key = &workload.keys[rng.random_range(0..workload.keys.len())];
        (key.as_str(), rng.random_bool(workload.failure_rate))
    };

    workload
        .resolver
        .get_or_refresh(key, workload.session_dependent, |_| async move {
            let value = workload.fetcher.fetch(key).await?;
            if fail {
                return Err(FetchError {
                    key: key.to_owned(),
                });
            }
            Ok(value)
        })
        .await
}
