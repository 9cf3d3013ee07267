use std::sync::Arc;
use std::time::Duration;

use wallet_cache::resolver::{CacheAndLockResolver, ResolverError};
use wallet_cache_test as test;

pub use test::{CountingFetcher, FetchError};

/// Setup tests and create a resolver together with the fetcher that backs it.
///
/// The `update_config` closure can modify the default resolver configuration. The default wait
/// budget is one second.
pub fn setup_resolver(
    latency: Duration,
    update_config: impl FnOnce(&mut wallet_cache::config::ResolverConfig),
) -> (Arc<CacheAndLockResolver<String>>, Arc<CountingFetcher>) {
    test::setup();

    let mut config = test::quick_config("balances", 10);
    update_config(&mut config);

    let resolver = Arc::new(test::resolver(config));
    let fetcher = Arc::new(CountingFetcher::new(latency));
    (resolver, fetcher)
}

/// Resolves `key` through `resolver`, refreshing it with `fetcher` if necessary.
pub async fn resolve(
    resolver: &CacheAndLockResolver<String>,
    fetcher: &CountingFetcher,
    key: &str,
) -> Result<Option<String>, ResolverError> {
    resolver
        .get_or_refresh(key, true, |_| fetcher.fetch(key))
        .await
}
