use std::time::Duration;

use wallet_cache::caching::Cache;

use crate::{CountingFetcher, setup_resolver};

#[tokio::test(start_paused = true)]
async fn test_session_boundary_drops_session_data() {
    let (resolver, fetcher) = setup_resolver(Duration::from_millis(10), |_| {});
    let fetcher: &CountingFetcher = &fetcher;

    let balance = resolver
        .get_or_refresh("balance_BTC", true, |_| fetcher.fetch("balance_BTC"))
        .await
        .unwrap();
    let rate = resolver
        .get_or_refresh("rates_BTC", false, |_| fetcher.fetch("rates_BTC"))
        .await
        .unwrap();
    assert_eq!(balance.as_deref(), Some("balance_BTC#1"));
    assert_eq!(rate.as_deref(), Some("rates_BTC#2"));

    resolver.cache().clear_session_dependent_data();

    assert_eq!(resolver.get_cached("balance_BTC").unwrap(), None);
    assert_eq!(
        resolver.get_cached("rates_BTC").unwrap().as_deref(),
        Some("rates_BTC#2")
    );

    let balance = resolver
        .get_or_refresh("balance_BTC", true, |_| fetcher.fetch("balance_BTC"))
        .await
        .unwrap();
    assert_eq!(balance.as_deref(), Some("balance_BTC#3"));
    assert_eq!(fetcher.computations(), 3);
}

#[tokio::test]
async fn test_resolvers_share_a_cache() {
    wallet_cache_test::setup();
    let cache = wallet_cache_test::memory_cache::<String>();
    let balances = wallet_cache::resolver::CacheAndLockResolver::new(
        wallet_cache_test::quick_config("balances", 10),
        cache.clone(),
    )
    .unwrap();
    let history = wallet_cache::resolver::CacheAndLockResolver::new(
        wallet_cache_test::quick_config("history", 10),
        cache.clone(),
    )
    .unwrap();

    balances
        .actualize_cached_data("wallet_1_balance", |_| Some("7".to_owned()), true)
        .unwrap();
    assert_eq!(
        history.get_cached("wallet_1_balance").unwrap().as_deref(),
        Some("7")
    );

    // locks are per resolver, so both can refresh the same key at once
    let balances_lock = balances.acquire_lock("wallet_1_balance").await;
    let history_lock = history.acquire_lock("wallet_1_balance").await;
    assert!(balances_lock.is_acquired());
    assert!(history_lock.is_acquired());

    history.invalidate_containing("wallet_1").unwrap();
    assert_eq!(cache.get("wallet_1_balance").unwrap(), None);
    assert!(
        balances
            .lock_manager()
            .is_the_lock_active_one("wallet_1_balance", balances_lock.lock_id().unwrap())
    );
}
