use std::time::Duration;

use tokio::time::Instant;

use crate::config::MemoryCacheConfig;

use super::{Cache, CacheError};

/// An item saved in one of the in-memory moka caches.
#[derive(Clone, Debug)]
struct CacheItem<V> {
    /// The actual data.
    value: V,
    /// When the value was last written, `None` once it was marked as expired.
    last_update: Option<Instant>,
    /// When to evict this item, `None` to keep it until it is invalidated.
    deadline: Option<Instant>,
}

impl<V> CacheItem<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            last_update: Some(now),
            deadline: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_evicted(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    fn time_to_live(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

type InMemoryCache<V> = moka::sync::Cache<String, CacheItem<V>>;

/// A struct implementing [`moka::Expiry`] that uses the [`CacheItem`] deadline as the explicit
/// expiration time.
///
/// Deadlines are also checked on every read, moka only takes care of reclaiming the memory.
struct CacheExpiration;

impl<V> moka::Expiry<String, CacheItem<V>> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheItem<V>,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        value.time_to_live()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheItem<V>,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value.time_to_live()
    }
}

/// An in-memory [`Cache`].
///
/// Session dependent and persistent items live in two separate moka caches, so that
/// [`clear_session_dependent_data`](Self::clear_session_dependent_data) can drop the former in
/// one go. A key lives in at most one of them: writing it to one partition removes it from the
/// other.
pub struct MemoryCache<V> {
    session: InMemoryCache<V>,
    persistent: InMemoryCache<V>,
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("session items", &self.session.entry_count())
            .field("persistent items", &self.persistent.entry_count())
            .finish()
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self {
            session: Self::build("session", config.session_capacity),
            persistent: Self::build("persistent", config.persistent_capacity),
        }
    }

    fn build(name: &str, capacity: u64) -> InMemoryCache<V> {
        InMemoryCache::builder()
            .name(name)
            .max_capacity(capacity)
            .expire_after(CacheExpiration)
            .build()
    }

    /// Drops all session dependent items, for example when the wallet logs out.
    pub fn clear_session_dependent_data(&self) {
        self.session.invalidate_all();
    }

    /// Finds the item stored under `key` and the partition it lives in.
    fn lookup(&self, key: &str) -> Option<(&InMemoryCache<V>, CacheItem<V>)> {
        let now = Instant::now();
        for partition in [&self.session, &self.persistent] {
            if let Some(item) = partition.get(key) {
                if item.is_evicted(now) {
                    partition.invalidate(key);
                    return None;
                }
                return Some((partition, item));
            }
        }
        None
    }

    fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(&mut CacheItem<V>),
    {
        if let Some((partition, mut item)) = self.lookup(key) {
            f(&mut item);
            partition.insert(key.to_owned(), item);
        }
    }
}

impl<V> Default for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(&MemoryCacheConfig::default())
    }
}

impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        Ok(self.lookup(key).map(|(_, item)| item.value))
    }

    fn put(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.session.invalidate(key);
        self.persistent
            .insert(key.to_owned(), CacheItem::new(value, ttl));
        Ok(())
    }

    fn put_session_dependent(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.persistent.invalidate(key);
        self.session.insert(key.to_owned(), CacheItem::new(value, ttl));
        Ok(())
    }

    fn last_update_timestamp(&self, key: &str) -> Result<Option<Instant>, CacheError> {
        Ok(self.lookup(key).and_then(|(_, item)| item.last_update))
    }

    fn get_with_last_update(&self, key: &str) -> Result<Option<(V, Option<Instant>)>, CacheError> {
        Ok(self
            .lookup(key)
            .map(|(_, item)| (item.value, item.last_update)))
    }

    fn set_last_update_timestamp(&self, key: &str, timestamp: Instant) -> Result<(), CacheError> {
        self.update(key, |item| item.last_update = Some(timestamp));
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.session.invalidate(key);
        self.persistent.invalidate(key);
        Ok(())
    }

    fn invalidate_containing(&self, key_part: &str) -> Result<(), CacheError> {
        for partition in [&self.session, &self.persistent] {
            let matching: Vec<_> = partition
                .iter()
                .filter(|(key, _)| key.contains(key_part))
                .map(|(key, _)| key)
                .collect();
            for key in matching {
                partition.invalidate(key.as_str());
            }
        }
        Ok(())
    }

    fn mark_as_expired_but_dont_remove(&self, key: &str) -> Result<(), CacheError> {
        self.update(key, |item| {
            item.last_update = None;
            item.deadline = None;
        });
        Ok(())
    }
}
