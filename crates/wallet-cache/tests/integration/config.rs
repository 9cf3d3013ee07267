use std::time::Duration;

use wallet_cache::config::Config;
use wallet_cache::resolver::CacheAndLockResolver;
use wallet_cache_test as helpers;

#[test]
fn test_config_from_file() {
    let dir = helpers::tempdir();
    let path = helpers::write_file(
        &dir,
        "config.yml",
        r#"
logging:
  level: debug
  format: json
cache:
  session_capacity: 500
resolvers:
  balances:
    cache_ttl: 30s
    remove_expired_cache_automatically: false
    max_wait_attempts: 20
    wait_attempt_interval: 250ms
"#,
    );

    let config = Config::get(Some(path.as_path())).unwrap();
    assert_eq!(config.cache.session_capacity, 500);
    assert_eq!(config.cache.persistent_capacity, 10_000);

    let balances = config.resolver("balances");
    assert_eq!(balances.wait_budget(), Duration::from_secs(5));

    let cache = helpers::memory_cache::<String>();
    let resolver = CacheAndLockResolver::new(balances, cache).unwrap();
    assert_eq!(resolver.bio(), "balances");
    assert_eq!(
        resolver.lock_manager().config().poll_interval,
        Duration::from_millis(250)
    );
}

#[test]
fn test_invalid_resolver_is_rejected() {
    let dir = helpers::tempdir();
    let path = helpers::write_file(
        &dir,
        "config.yml",
        r#"
resolvers:
  prices:
    cache_ttl: 1s
    remove_expired_cache_automatically: false
"#,
    );

    let config = Config::get(Some(path.as_path())).unwrap();
    let err = CacheAndLockResolver::<String>::new(
        config.resolver("prices"),
        helpers::memory_cache(),
    )
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        r#"cache ttl of resolver "prices" is 1s, but must be at least 2s when expired values are kept"#
    );
}

#[test]
fn test_missing_and_empty_files() {
    let dir = helpers::tempdir();
    assert!(Config::get(Some(dir.path().join("missing.yml").as_path())).is_err());

    let path = helpers::write_file(&dir, "empty.yml", "\n");
    let err = Config::get(Some(path.as_path())).unwrap_err();
    assert_eq!(err.to_string(), "config file empty");

    assert!(Config::get(None).unwrap().resolvers.is_empty());
}
