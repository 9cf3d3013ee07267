//! Request de-duplication and caching for wallet services.
//!
//! Wallet services (balance providers, fee estimators, price feeds) talk to external, rate
//! limited APIs. This crate makes sure that concurrent requests for the same resource are
//! collapsed into a single refresh, and that everybody else either waits for that refresh or
//! falls back to whatever value is already cached.
//!
//! The building blocks are:
//!
//! - [`ResourceLockManager`](locking::ResourceLockManager), which tracks which calculation
//!   currently owns the right to refresh a resource key and wakes up waiters on hand-off.
//! - The [`Cache`](caching::Cache) trait, the key-value store with TTL the resolver reads from
//!   and writes to, with [`MemoryCache`](caching::MemoryCache) as the default implementation.
//! - [`CacheAndLockResolver`](resolver::CacheAndLockResolver), the protocol callers use: "give me
//!   a fresh cached value, or make me the one who refreshes it".

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod locking;
pub mod logging;
pub mod resolver;
