//! # The cache-and-lock protocol
//!
//! [`CacheAndLockResolver`] turns "is there a fresh cached value, and if not, may I be the one to
//! refresh it?" into a single call, and guards the write-back of refreshed values.
//!
//! A typical caller looks like this:
//!
//! ```ignore
//! match resolver.get_cached_or_wait_for_cached_or_acquire_lock(&key).await? {
//!     Resolution::UseCached { cached_data } => cached_data,
//!     Resolution::CanStartDataRetrieval { cached_data, lock_id } => {
//!         let result = fetch_balance().await;
//!         if let Ok(balance) = &result {
//!             resolver.save_cached_data(&key, lock_id, balance.clone(), true, false)?;
//!         }
//!         resolver.release_lock(&key, lock_id);
//!         result.ok().or(cached_data)
//!     }
//! }
//! ```
//!
//! ## Lost updates
//!
//! A refresh can take a while, and the cache may be invalidated or patched in the meantime. Both
//! of these force-release the lock of the running refresh, and [`save_cached_data`] refuses to
//! write data computed under a lock that is no longer active. The only exception is data that
//! was merged with the most recent cache state without any suspension point in between, which
//! cannot have been overtaken by another writer.
//!
//! [`actualize_cached_data`] deliberately favors responsiveness: it patches the cached value in
//! place right away and discards any refresh that is running at that moment, since that refresh
//! would otherwise overwrite the patch with older data.
//!
//! [`save_cached_data`]: CacheAndLockResolver::save_cached_data
//! [`actualize_cached_data`]: CacheAndLockResolver::actualize_cached_data

use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;

use crate::caching::{Cache, CacheError, MemoryCache};
use crate::config::{ConfigError, ResolverConfig};
use crate::locking::{CalculationStart, LockAcquisition, LockId, ResourceLockManager};


/// The answer to [`CacheAndLockResolver::get_cached_or_wait_for_cached_or_acquire_lock`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution<V> {
    /// The caller owns the lock and should refresh the value.
    ///
    /// `cached_data` is whatever the cache held, possibly an expired value, so that the caller can
    /// merge with it or fall back to it if the refresh fails.
    CanStartDataRetrieval {
        cached_data: Option<V>,
        lock_id: LockId,
    },
    /// The caller should use `cached_data`.
    ///
    /// Either somebody else just refreshed the value, or waiting for them timed out and this is
    /// the best value available.
    UseCached { cached_data: Option<V> },
}

impl<V> Resolution<V> {
    pub fn can_start_data_retrieval(&self) -> bool {
        matches!(self, Self::CanStartDataRetrieval { .. })
    }

    pub fn lock_id(&self) -> Option<LockId> {
        match self {
            Self::CanStartDataRetrieval { lock_id, .. } => Some(*lock_id),
            Self::UseCached { .. } => None,
        }
    }

    pub fn cached_data(&self) -> Option<&V> {
        match self {
            Self::CanStartDataRetrieval { cached_data, .. } | Self::UseCached { cached_data } => {
                cached_data.as_ref()
            }
        }
    }

    pub fn into_cached_data(self) -> Option<V> {
        match self {
            Self::CanStartDataRetrieval { cached_data, .. } | Self::UseCached { cached_data } => {
                cached_data
            }
        }
    }
}

/// A [`CacheError`] annotated with the resolver and the operation that failed.
#[derive(Debug, Error)]
#[error("resolver {bio:?} failed to {operation}")]
pub struct ResolverError {
    pub bio: String,
    pub operation: &'static str,
    #[source]
    pub source: CacheError,
}

/// Releases a lock when dropped.
struct LockGuard<'a, V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Cache<V>,
{
    resolver: &'a CacheAndLockResolver<V, C>,
    key: &'a str,
    lock_id: LockId,
}

impl<V, C> Drop for LockGuard<'_, V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Cache<V>,
{
    fn drop(&mut self) {
        self.resolver.release_lock(self.key, self.lock_id);
    }
}

/// What a cache read found under a key.
enum CacheRead<V> {
    Missing,
    Fresh(V),
    Stale(V),
}

/// Deduplicates refreshes of cached values.
///
/// Every resolver has its own [`ResourceLockManager`] and thus its own key space, while the
/// [`Cache`] may be shared with other resolvers.
pub struct CacheAndLockResolver<V, C = MemoryCache<V>> {
    config: ResolverConfig,
    cache: Arc<C>,
    locks: ResourceLockManager,
    _value: PhantomData<fn() -> V>,
}

impl<V, C> std::fmt::Debug for CacheAndLockResolver<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAndLockResolver")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .finish()
    }
}

impl<V, C> CacheAndLockResolver<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Cache<V>,
{
    /// Creates a new resolver on top of `cache`.
    ///
    /// # Errors
    ///
    /// Fails if expired values are kept around and the TTL is shorter than two wait intervals.
    pub fn new(mut config: ResolverConfig, cache: Arc<C>) -> Result<Self, ConfigError> {
        config.validate()?;
        config.cache_ttl = config.effective_cache_ttl();
        let locks = ResourceLockManager::new(config.lock_manager());

        Ok(Self {
            config,
            cache,
            locks,
            _value: PhantomData,
        })
    }

    pub fn bio(&self) -> &str {
        &self.config.bio
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn lock_manager(&self) -> &ResourceLockManager {
        &self.locks
    }

    fn error(&self, operation: &'static str) -> impl FnOnce(CacheError) -> ResolverError + '_ {
        move |source| ResolverError {
            bio: self.config.bio.clone(),
            operation,
            source,
        }
    }

    /// Returns a fresh cached value, or makes the caller the one to refresh it.
    ///
    /// 1. A fresh value in the cache is returned right away.
    /// 2. Otherwise the caller tries to become the owner of `key`. If somebody else owns it, the
    ///    caller waits for them to finish and then looks at the cache again.
    /// 3. This repeats until the caller owns the key, a fresh value shows up, or the total wait
    ///    budget of the resolver is exhausted.
    ///
    /// Expired values that are kept around are never treated as fresh, but they are handed out
    /// as `cached_data` whenever nothing better is available.
    pub async fn get_cached_or_wait_for_cached_or_acquire_lock(
        &self,
        key: &str,
    ) -> Result<Resolution<V>, ResolverError> {
        let operation = "get_cached_or_wait_for_cached_or_acquire_lock";
        let bio = self.bio();
        metric!(counter("resolver.access") += 1, "resolver" => bio);

        let deadline = Instant::now() + self.config.wait_budget();
        let mut backup = None;
        let mut fresh = self
            .read_fresh(key, &mut backup)
            .map_err(self.error(operation))?;

        if fresh.is_some() {
            metric!(counter("resolver.cache.hit") += 1, "resolver" => bio);
            return Ok(Resolution::UseCached { cached_data: fresh });
        }
        if backup.is_some() {
            metric!(counter("resolver.cache.stale") += 1, "resolver" => bio);
        }

        // a free key is always claimed, even with a zero wait budget
        let mut lock_id = None;
        loop {
            match self
                .locks
                .start_calculation_or_wait_until(key, deadline)
                .await
            {
                CalculationStart::Started(id) => lock_id = Some(id),
                CalculationStart::ActiveFinished => {}
                CalculationStart::TimedOut => {
                    tracing::warn!(
                        resolver = bio,
                        key,
                        "Timed out waiting for an already running request"
                    );
                    metric!(counter("resolver.lock.wait_timeout") += 1, "resolver" => bio);
                }
            }
            fresh = self
                .read_fresh(key, &mut backup)
                .map_err(self.error(operation))?;

            if lock_id.is_some() || fresh.is_some() || Instant::now() >= deadline {
                break;
            }
        }

        let cached_data = fresh.or(backup);
        Ok(match lock_id {
            Some(lock_id) => {
                tracing::debug!(resolver = bio, key, %lock_id, "Starting data retrieval");
                metric!(counter("resolver.lock.acquired") += 1, "resolver" => bio);
                Resolution::CanStartDataRetrieval {
                    cached_data,
                    lock_id,
                }
            }
            None => Resolution::UseCached { cached_data },
        })
    }

    /// Runs the whole protocol for a single value.
    ///
    /// Returns the fresh cached value if there is one. Otherwise, if this caller gets the lock,
    /// `refresh` is called with the (possibly expired) cached value, and its result is saved and
    /// returned. A failed refresh is logged and the cached value is returned instead, as is the
    /// case when waiting for somebody else's refresh timed out.
    ///
    /// The lock is released when the refresh is done, and also when the returned future is
    /// dropped half-way.
    pub async fn get_or_refresh<F, Fut, E>(
        &self,
        key: &str,
        session_dependent: bool,
        refresh: F,
    ) -> Result<Option<V>, ResolverError>
    where
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: std::error::Error + 'static,
    {
        let (cached_data, lock_id) = match self
            .get_cached_or_wait_for_cached_or_acquire_lock(key)
            .await?
        {
            Resolution::UseCached { cached_data } => return Ok(cached_data),
            Resolution::CanStartDataRetrieval {
                cached_data,
                lock_id,
            } => (cached_data, lock_id),
        };
        let _guard = LockGuard {
            resolver: self,
            key,
            lock_id,
        };

        match refresh(cached_data.clone()).await {
            Ok(data) => {
                self.save_cached_data(key, lock_id, data.clone(), session_dependent, false)?;
                Ok(Some(data))
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    resolver = self.bio(),
                    key,
                    "Refresh failed, falling back to cached data"
                );
                metric!(counter("resolver.refresh.failed") += 1, "resolver" => self.bio());
                Ok(cached_data)
            }
        }
    }

    /// Returns the current cached value, without locking or waiting.
    ///
    /// Values that are kept around after they expired are returned as well.
    pub fn get_cached(&self, key: &str) -> Result<Option<V>, ResolverError> {
        self.cache.get(key).map_err(self.error("get_cached"))
    }

    /// Requests the lock for `key` regardless of what is cached.
    ///
    /// This is for callers that must always perform the refresh themselves. They are queued
    /// behind the current owner and served in arrival order.
    pub async fn acquire_lock(&self, key: &str) -> LockAcquisition {
        self.locks.acquire_lock(key).await
    }

    /// Writes `data` to the cache if `lock_id` still owns `key`.
    ///
    /// Data computed under a lock that was released or taken over in the meantime is discarded,
    /// unless `was_data_merged_synchronously_with_most_recent_cache_state` is set: a caller that
    /// read the most recent cache state and merged it with `data` without any suspension point in
    /// between cannot overwrite anything newer.
    ///
    /// `session_dependent` data is dropped on session boundaries.
    ///
    /// Returns whether the data was written.
    pub fn save_cached_data(
        &self,
        key: &str,
        lock_id: LockId,
        data: V,
        session_dependent: bool,
        was_data_merged_synchronously_with_most_recent_cache_state: bool,
    ) -> Result<bool, ResolverError> {
        if !was_data_merged_synchronously_with_most_recent_cache_state
            && !self.locks.is_the_lock_active_one(key, lock_id)
        {
            tracing::warn!(
                resolver = self.bio(),
                key,
                %lock_id,
                "Discarding data computed under a lock that is no longer active"
            );
            metric!(counter("resolver.save.rejected") += 1, "resolver" => self.bio());
            return Ok(false);
        }

        self.store(key, data, session_dependent)
            .map_err(self.error("save_cached_data"))?;
        Ok(true)
    }

    /// Releases the lock on `key`, if `lock_id` still owns it.
    ///
    /// A lock that was force-released or handed over in the meantime is left alone, as it may
    /// already belong to somebody else.
    pub fn release_lock(&self, key: &str, lock_id: LockId) {
        if self.locks.is_the_lock_active_one(key, lock_id) {
            self.locks.finish_active_calculation(key);
        } else {
            tracing::debug!(
                resolver = self.bio(),
                key,
                %lock_id,
                "Not releasing a lock that is no longer active"
            );
        }
    }

    /// Patches the cached value of `key` in place.
    ///
    /// `processor` gets the current value and returns `Some` with the new value if it changed
    /// anything. The new value is written right away and any running refresh of `key` is
    /// force-released, so it can not overwrite the patch with older data.
    ///
    /// Returns whether the value was modified.
    pub fn actualize_cached_data<F>(
        &self,
        key: &str,
        processor: F,
        session_dependent: bool,
    ) -> Result<bool, ResolverError>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let operation = "actualize_cached_data";
        let current = self.cache.get(key).map_err(self.error(operation))?;
        let Some(updated) = processor(current) else {
            return Ok(false);
        };

        self.store(key, updated, session_dependent)
            .map_err(self.error(operation))?;
        self.locks.finish_active_calculation(key);
        tracing::debug!(resolver = self.bio(), key, "Actualized cached data");
        Ok(true)
    }

    /// Removes the cached value of `key` and force-releases its lock.
    pub fn invalidate(&self, key: &str) -> Result<(), ResolverError> {
        self.cache.invalidate(key).map_err(self.error("invalidate"))?;
        self.locks.finish_active_calculation(key);
        metric!(counter("resolver.invalidate") += 1, "resolver" => self.bio());
        Ok(())
    }

    /// Removes all cached values whose key contains `key_part`, and force-releases their locks.
    pub fn invalidate_containing(&self, key_part: &str) -> Result<(), ResolverError> {
        self.cache
            .invalidate_containing(key_part)
            .map_err(self.error("invalidate_containing"))?;
        self.locks.finish_all_active_calculations(key_part);
        metric!(counter("resolver.invalidate") += 1, "resolver" => self.bio());
        Ok(())
    }

    /// Marks the cached value of `key` as expired, and force-releases its lock.
    ///
    /// The value stays available as a fallback, but the next caller will refresh it.
    pub fn mark_as_expired_but_dont_remove(&self, key: &str) -> Result<(), ResolverError> {
        self.cache
            .mark_as_expired_but_dont_remove(key)
            .map_err(self.error("mark_as_expired_but_dont_remove"))?;
        self.locks.finish_active_calculation(key);
        Ok(())
    }

    fn store(&self, key: &str, data: V, session_dependent: bool) -> Result<(), CacheError> {
        // with automatic removal the cache evicts on its own, otherwise the value is kept
        let ttl = self
            .config
            .remove_expired_cache_automatically
            .then_some(self.config.cache_ttl)
            .flatten();
        if session_dependent {
            self.cache.put_session_dependent(key, data, ttl)?;
        } else {
            self.cache.put(key, data, ttl)?;
        }
        self.cache.set_last_update_timestamp(key, Instant::now())
    }

    fn read(&self, key: &str) -> Result<CacheRead<V>, CacheError> {
        let Some((value, last_update)) = self.cache.get_with_last_update(key)? else {
            return Ok(CacheRead::Missing);
        };

        let is_stale = match last_update {
            None => true,
            Some(last_update) => self
                .config
                .cache_ttl
                .is_some_and(|ttl| last_update + ttl <= Instant::now()),
        };
        Ok(if is_stale {
            CacheRead::Stale(value)
        } else {
            CacheRead::Fresh(value)
        })
    }

    /// Returns the fresh value of `key`, remembering a stale one in `backup`.
    fn read_fresh(&self, key: &str, backup: &mut Option<V>) -> Result<Option<V>, CacheError> {
        Ok(match self.read(key)? {
            CacheRead::Missing => None,
            CacheRead::Fresh(value) => Some(value),
            CacheRead::Stale(value) => {
                *backup = Some(value);
                None
            }
        })
    }
}
