use std::time::Duration;

use futures::future::join_all;
use tokio::time::{self, Instant};

use crate::{resolve, setup_resolver};

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_compute_once() {
    let (resolver, fetcher) = setup_resolver(Duration::from_millis(300), |_| {});

    let requests = (0..20).map(|_| resolve(&resolver, &fetcher, "balance_BTC"));
    let results = join_all(requests).await;

    for result in results {
        assert_eq!(result.unwrap().as_deref(), Some("balance_BTC#1"));
    }
    assert_eq!(fetcher.computations(), 1);
    assert_eq!(resolver.lock_manager().active_calculations_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_refresh_in_parallel() {
    let latency = Duration::from_millis(300);
    let (resolver, fetcher) = setup_resolver(latency, |_| {});
    let keys = ["balance_BTC", "balance_ETH", "balance_LTC"];

    let start = Instant::now();
    let requests = keys
        .iter()
        .cycle()
        .take(15)
        .map(|key| resolve(&resolver, &fetcher, key));
    let results = join_all(requests).await;

    assert!(results.iter().all(|result| matches!(result, Ok(Some(_)))));
    assert_eq!(fetcher.computations(), keys.len());
    // the three refreshes overlap instead of running one after the other
    assert!(start.elapsed() < latency * 2);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_retries_after_failed_refresh() {
    let (resolver, fetcher) = setup_resolver(Duration::from_millis(300), |_| {});
    fetcher.fail_next(1);

    let (first, second) = futures::join!(
        resolve(&resolver, &fetcher, "fees_ETH"),
        resolve(&resolver, &fetcher, "fees_ETH"),
    );

    // nothing was cached to fall back to
    assert_eq!(first.unwrap(), None);
    assert_eq!(second.unwrap().as_deref(), Some("fees_ETH#2"));
    assert_eq!(fetcher.computations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_refresh_serves_expired_value() {
    let (resolver, fetcher) = setup_resolver(Duration::from_secs(10), |config| {
        config.cache_ttl = Some(Duration::from_secs(60));
        config.remove_expired_cache_automatically = false;
    });
    resolver
        .actualize_cached_data("rates_USD", |_| Some("64000".to_owned()), false)
        .unwrap();

    time::advance(Duration::from_secs(61)).await;

    let (refreshing, waiting) = futures::join!(
        resolve(&resolver, &fetcher, "rates_USD"),
        async {
            let start = Instant::now();
            let result = resolve(&resolver, &fetcher, "rates_USD").await;
            (result, start.elapsed())
        },
    );

    let (waiting, waited) = waiting;
    assert_eq!(waiting.unwrap().as_deref(), Some("64000"));
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(10));

    assert_eq!(refreshing.unwrap().as_deref(), Some("rates_USD#1"));
    assert_eq!(fetcher.computations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_discards_running_refresh() {
    let (resolver, fetcher) = setup_resolver(Duration::from_millis(300), |_| {});

    let (refreshed, ()) = futures::join!(resolve(&resolver, &fetcher, "balance_XRP"), async {
        time::sleep(Duration::from_millis(100)).await;
        resolver.invalidate_containing("balance_").unwrap();
    });

    // the caller still gets what it computed, but the cache does not
    assert_eq!(refreshed.unwrap().as_deref(), Some("balance_XRP#1"));
    assert_eq!(resolver.get_cached("balance_XRP").unwrap(), None);

    let next = resolve(&resolver, &fetcher, "balance_XRP").await;
    assert_eq!(next.unwrap().as_deref(), Some("balance_XRP#2"));
}
