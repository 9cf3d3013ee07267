//! # Cache storage
//!
//! The [`CacheAndLockResolver`](crate::resolver::CacheAndLockResolver) does not store anything
//! itself. It reads and writes through the [`Cache`] trait, which is the capability set a
//! key-value store with TTL has to offer:
//!
//! - plain reads, and writes with an optional TTL,
//! - a separate write path for *session dependent* data, which is dropped on session boundaries
//!   such as a wallet logout,
//! - access to the last-update timestamp, used to detect staleness when expired values are kept
//!   around as a fallback,
//! - invalidation by exact key or by key substring, and
//! - marking a value as expired without removing it.
//!
//! [`MemoryCache`] is the in-memory implementation based on [`moka`].
//!
//! ## Staleness
//!
//! An item is *fresh* while its last update plus the resolver's TTL lies in the future, and
//! *stale* afterwards. A stale item is either evicted by the cache (when it was stored with a TTL)
//! or kept as a fallback value. Items marked via [`Cache::mark_as_expired_but_dont_remove`] report
//! no last-update timestamp at all and are always stale.

use std::time::Duration;

use tokio::time::Instant;

mod cache_error;
mod memory;


pub use cache_error::*;
pub use memory::*;

/// A key-value store with per-item TTL.
///
/// Implementations have to be cheap to call: the resolver calls them in between its own
/// suspension points and expects them to return right away.
pub trait Cache<V>: Send + Sync {
    /// Returns the value stored under `key`, unless it is missing or was evicted.
    fn get(&self, key: &str) -> Result<Option<V>, CacheError>;

    /// Stores `value` under `key`, independent of the session.
    ///
    /// With a `ttl`, the item is evicted once it elapsed. Without one it is kept until it is
    /// invalidated.
    fn put(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Stores `value` under `key`, to be dropped on the next session boundary.
    fn put_session_dependent(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Returns when the value stored under `key` was last updated.
    ///
    /// Returns `None` if there is no such value, or if it was marked as expired.
    fn last_update_timestamp(&self, key: &str) -> Result<Option<Instant>, CacheError>;

    /// Returns the value stored under `key` together with its last-update timestamp.
    ///
    /// Both come from the same lookup, so an item that is evicted in between can not show up as a
    /// value without a timestamp.
    fn get_with_last_update(&self, key: &str) -> Result<Option<(V, Option<Instant>)>, CacheError>;

    /// Overrides the last-update timestamp of the value stored under `key`, if any.
    fn set_last_update_timestamp(&self, key: &str, timestamp: Instant) -> Result<(), CacheError>;

    /// Removes the value stored under `key`.
    fn invalidate(&self, key: &str) -> Result<(), CacheError>;

    /// Removes all values whose key contains `key_part`.
    fn invalidate_containing(&self, key_part: &str) -> Result<(), CacheError>;

    /// Marks the value stored under `key` as expired, but keeps it as a fallback value.
    fn mark_as_expired_but_dont_remove(&self, key: &str) -> Result<(), CacheError>;
}
