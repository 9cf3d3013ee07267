//! Serializes refreshes of the same resource.
//!
//! The [`ResourceLockManager`] tracks, per resource key, which calculation currently owns the
//! right to refresh that resource. Everybody else either waits for the owner to finish, or
//! queues up to become the next owner.
//!
//! Waiters are woken up through a per-key [`watch`] channel that publishes the current owner,
//! so hand-offs are noticed immediately. Every wait is still bounded by the configured
//! [`wait_budget`](LockManagerConfig::wait_budget), and running out of it is a regular outcome
//! rather than an error.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

pub use crate::config::LockManagerConfig;

/// An opaque token representing the right to refresh a resource.
///
/// It is handed out when a lock is acquired and checked whenever the holder wants to write back
/// data or release the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockId(Uuid);

impl LockId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of [`ResourceLockManager::start_calculation_or_wait_for_active_to_finish`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalculationStart {
    /// The resource was free, the caller now owns it.
    Started(LockId),
    /// Another calculation owned the resource and has since finished.
    ActiveFinished,
    /// Another calculation owned the resource and did not finish in time.
    TimedOut,
}

/// Outcome of [`ResourceLockManager::acquire_lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The caller owns the resource.
    Acquired(LockId),
    /// The caller gave up waiting for its turn.
    TimedOut,
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    pub fn lock_id(&self) -> Option<LockId> {
        match self {
            Self::Acquired(lock_id) => Some(*lock_id),
            Self::TimedOut => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Satisfied,
    TimedOut,
    Failed,
}

impl WaitOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Satisfied => "satisfied",
            Self::TimedOut => "timeout",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct KeyState {
    /// The calculation currently allowed to refresh the resource.
    active: Option<LockId>,
    /// Calculations that asked for the lock while it was taken, in arrival order.
    queue: VecDeque<LockId>,
    /// Publishes every change of `active`.
    owner: watch::Sender<Option<LockId>>,
}

impl KeyState {
    fn new() -> Self {
        let (owner, _) = watch::channel(None);
        Self {
            active: None,
            queue: VecDeque::new(),
            owner,
        }
    }

    fn set_active(&mut self, lock_id: Option<LockId>) {
        self.active = lock_id;
        self.owner.send_replace(lock_id);
    }

    /// Nobody owns, queues for, or watches this key, so its state can be dropped.
    fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty() && self.owner.receiver_count() == 0
    }
}

type Keys = HashMap<String, KeyState>;

/// Tracks which calculation owns which resource.
///
/// Each instance has its own key space. All state transitions happen under a short-lived mutex
/// that is never held across an `.await`.
#[derive(Debug, Default)]
pub struct ResourceLockManager {
    config: LockManagerConfig,
    keys: Mutex<Keys>,
}

impl ResourceLockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            config,
            keys: Default::default(),
        }
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    fn lock_keys(&self) -> MutexGuard<'_, Keys> {
        // The state is consistent after every single mutation, so a panic elsewhere does not
        // leave it half-updated.
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Becomes the owner of `key` if it is free, or waits for the current owner to finish.
    ///
    /// Returns [`CalculationStart::Started`] if the caller is now licensed to refresh the
    /// resource. Otherwise this waits until the owner of `key` changes and returns
    /// [`CalculationStart::ActiveFinished`], or [`CalculationStart::TimedOut`] once the
    /// [`wait_budget`](LockManagerConfig::wait_budget) is exhausted. Waiting does not change the
    /// ownership of `key`.
    pub async fn start_calculation_or_wait_for_active_to_finish(
        &self,
        key: &str,
    ) -> CalculationStart {
        let deadline = Instant::now() + self.config.wait_budget();
        self.start_calculation_or_wait_until(key, deadline).await
    }

    /// Same as [`start_calculation_or_wait_for_active_to_finish`](Self::start_calculation_or_wait_for_active_to_finish),
    /// but gives up at an explicit `deadline`.
    pub async fn start_calculation_or_wait_until(
        &self,
        key: &str,
        deadline: Instant,
    ) -> CalculationStart {
        let (observed, mut waiter) = {
            let mut keys = self.lock_keys();
            let state = keys.entry(key.to_owned()).or_insert_with(KeyState::new);
            match state.active {
                None => {
                    let lock_id = LockId::new();
                    state.set_active(Some(lock_id));
                    tracing::trace!(key, %lock_id, "Started calculation");
                    return CalculationStart::Started(lock_id);
                }
                Some(active) => (active, Waiter::new(self, key, state, None)),
            }
        };

        tracing::trace!(key, active = %observed, "Waiting for active calculation to finish");
        let outcome = waiter
            .wait_until(deadline, |owner| *owner != Some(observed))
            .await;

        match outcome {
            WaitOutcome::Satisfied => CalculationStart::ActiveFinished,
            WaitOutcome::TimedOut | WaitOutcome::Failed => CalculationStart::TimedOut,
        }
    }

    /// Requests the lock for `key`, queueing behind the current owner if necessary.
    ///
    /// Queued requests are served in arrival order: when an owner releases the lock, the head of
    /// the queue becomes the new owner. A request that runs out of its
    /// [`wait_budget`](LockManagerConfig::wait_budget) leaves the queue and returns
    /// [`LockAcquisition::TimedOut`].
    pub async fn acquire_lock(&self, key: &str) -> LockAcquisition {
        let lock_id = LockId::new();
        let mut waiter = {
            let mut keys = self.lock_keys();
            let state = keys.entry(key.to_owned()).or_insert_with(KeyState::new);
            if state.active.is_none() {
                state.set_active(Some(lock_id));
                tracing::trace!(key, %lock_id, "Acquired free lock");
                return LockAcquisition::Acquired(lock_id);
            }
            state.queue.push_back(lock_id);
            Waiter::new(self, key, state, Some(lock_id))
        };

        tracing::trace!(key, %lock_id, "Queued for lock");
        let deadline = Instant::now() + self.config.wait_budget();
        let outcome = waiter
            .wait_until(deadline, |owner| *owner == Some(lock_id))
            .await;

        // we might have been promoted right as the deadline passed
        if outcome == WaitOutcome::Satisfied || self.is_the_lock_active_one(key, lock_id) {
            waiter.queued = None;
            return LockAcquisition::Acquired(lock_id);
        }

        tracing::debug!(key, %lock_id, "Gave up waiting for lock");
        LockAcquisition::TimedOut
    }

    /// Releases the current owner of `key` and promotes the next queued request, if any.
    ///
    /// Releasing a key nobody owns is a no-op.
    pub fn finish_active_calculation(&self, key: &str) {
        let mut keys = self.lock_keys();
        release(&mut keys, key);
    }

    /// Releases every owned key that contains `key_part`.
    ///
    /// Matching is plain substring containment, so an empty `key_part` releases everything.
    pub fn finish_all_active_calculations(&self, key_part: &str) {
        let mut keys = self.lock_keys();
        let matching: Vec<String> = keys
            .iter()
            .filter(|(key, state)| state.active.is_some() && key.contains(key_part))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &matching {
            release(&mut keys, key);
        }
        tracing::trace!(key_part, released = matching.len(), "Finished calculations");
    }

    /// Whether `lock_id` is the current owner of `key`.
    pub fn is_the_lock_active_one(&self, key: &str, lock_id: LockId) -> bool {
        self.lock_keys()
            .get(key)
            .is_some_and(|state| state.active == Some(lock_id))
    }

    /// The number of keys that currently have an owner.
    pub fn active_calculations_count(&self) -> usize {
        self.lock_keys()
            .values()
            .filter(|state| state.active.is_some())
            .count()
    }

    /// The number of requests queued for `key`.
    pub fn queued_calculations_count(&self, key: &str) -> usize {
        self.lock_keys()
            .get(key)
            .map_or(0, |state| state.queue.len())
    }
}

/// A caller waiting for the owner of a key to change.
///
/// Dropping it, also half-way through a wait, cleans up after the caller: a queued request
/// leaves the queue (or hands the lock on, if it was promoted in the meantime), and the key's
/// state is dropped once it is idle.
struct Waiter<'a> {
    manager: &'a ResourceLockManager,
    key: &'a str,
    receiver: Option<watch::Receiver<Option<LockId>>>,
    /// The queued request, until it is handed to the caller.
    queued: Option<LockId>,
}

impl<'a> Waiter<'a> {
    fn new(
        manager: &'a ResourceLockManager,
        key: &'a str,
        state: &KeyState,
        queued: Option<LockId>,
    ) -> Self {
        Self {
            manager,
            key,
            receiver: Some(state.owner.subscribe()),
            queued,
        }
    }

    /// Waits until `condition` holds for the owner of the key, or until `deadline`.
    ///
    /// This never fails: a broken notification channel is logged and reported as
    /// [`WaitOutcome::Failed`], which callers treat like a timeout.
    async fn wait_until<F>(&mut self, deadline: Instant, condition: F) -> WaitOutcome
    where
        F: FnMut(&Option<LockId>) -> bool,
    {
        let key = self.key;
        let Some(receiver) = self.receiver.as_mut() else {
            return WaitOutcome::Failed;
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout_at(deadline, receiver.wait_for(condition)).await {
            Ok(Ok(_)) => WaitOutcome::Satisfied,
            Ok(Err(error)) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    key,
                    "Lock owner notifications stopped while waiting",
                );
                WaitOutcome::Failed
            }
            Err(_) => {
                tracing::debug!(key, "Waiting for lock owner timed out");
                WaitOutcome::TimedOut
            }
        };

        metric!(timer("locks.wait") = started.elapsed(), "outcome" => outcome.as_str());
        outcome
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // the receiver counts as a watcher, so it has to go before the idle check
        drop(self.receiver.take());

        let mut keys = self.manager.lock_keys();
        let Some(state) = keys.get_mut(self.key) else {
            return;
        };
        if let Some(lock_id) = self.queued {
            if state.active == Some(lock_id) {
                tracing::debug!(key = self.key, %lock_id, "Handing on an abandoned lock");
                release(&mut keys, self.key);
                return;
            }
            state.queue.retain(|queued| *queued != lock_id);
        }
        if state.is_idle() {
            keys.remove(self.key);
        }
    }
}

fn release(keys: &mut Keys, key: &str) {
    let Some(state) = keys.get_mut(key) else {
        return;
    };
    let Some(finished) = state.active else {
        return;
    };

    let next = state.queue.pop_front();
    state.set_active(next);
    match next {
        Some(next) => tracing::trace!(key, %finished, %next, "Handed lock over"),
        None => tracing::trace!(key, %finished, "Finished calculation"),
    }

    if state.is_idle() {
        keys.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time;

    use super::*;

    fn manager(max_polls: u32, poll_interval: Duration) -> ResourceLockManager {
        ResourceLockManager::new(LockManagerConfig {
            max_polls,
            poll_interval,
        })
    }

    #[tokio::test]
    async fn test_start_on_free_key() {
        let manager = ResourceLockManager::default();

        let CalculationStart::Started(lock_id) = manager
            .start_calculation_or_wait_for_active_to_finish("balance_BTC")
            .await
        else {
            panic!("free key should be started right away");
        };

        assert!(manager.is_the_lock_active_one("balance_BTC", lock_id));
        assert!(!manager.is_the_lock_active_one("balance_ETH", lock_id));
        assert_eq!(manager.active_calculations_count(), 1);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        time::pause();
        let manager = Arc::new(manager(10, Duration::from_millis(100)));

        let first = manager
            .start_calculation_or_wait_for_active_to_finish("fees")
            .await;
        let CalculationStart::Started(first_id) = first else {
            panic!("expected to own the free key, got {first:?}");
        };

        let waiter = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .start_calculation_or_wait_for_active_to_finish("fees")
                    .await
            }
        });

        time::sleep(Duration::from_millis(50)).await;
        // the waiter must not have taken over
        assert!(manager.is_the_lock_active_one("fees", first_id));
        assert_eq!(manager.active_calculations_count(), 1);

        manager.finish_active_calculation("fees");
        assert_eq!(waiter.await.unwrap(), CalculationStart::ActiveFinished);

        // waiting does not grant ownership, the key is free again
        assert_eq!(manager.active_calculations_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        time::pause();
        let manager = manager(5, Duration::from_millis(100));

        let first = manager.start_calculation_or_wait_for_active_to_finish("k").await;
        assert!(matches!(first, CalculationStart::Started(_)));

        let start = Instant::now();
        let second = manager.start_calculation_or_wait_for_active_to_finish("k").await;
        assert_eq!(second, CalculationStart::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_queued_locks_are_fifo() {
        time::pause();
        let manager = manager(100, Duration::from_millis(100));
        let order = Mutex::new(Vec::new());

        let LockAcquisition::Acquired(_) = manager.acquire_lock("rates").await else {
            panic!("free lock should be acquired right away");
        };

        let waiter = |name: &'static str| {
            let manager = &manager;
            let order = &order;
            async move {
                let acquisition = manager.acquire_lock("rates").await;
                let lock_id = acquisition.lock_id().expect("queued lock times out");
                assert!(manager.is_the_lock_active_one("rates", lock_id));
                order.lock().unwrap().push(name);
                time::sleep(Duration::from_millis(10)).await;
                manager.finish_active_calculation("rates");
            }
        };
        let release_first = async {
            time::sleep(Duration::from_millis(1)).await;
            assert_eq!(manager.queued_calculations_count("rates"), 3);
            manager.finish_active_calculation("rates");
        };

        // `join!` polls in order, so the waiters queue up as "a", "b", "c"
        futures::join!(waiter("a"), waiter("b"), waiter("c"), release_first);

        assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);
        assert_eq!(manager.active_calculations_count(), 0);
        assert_eq!(manager.queued_calculations_count("rates"), 0);
    }

    #[tokio::test]
    async fn test_queued_lock_times_out_and_leaves_queue() {
        time::pause();
        let manager = manager(3, Duration::from_millis(10));

        let owner = manager.acquire_lock("k").await;
        assert!(owner.is_acquired());

        let start = Instant::now();
        assert_eq!(manager.acquire_lock("k").await, LockAcquisition::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(manager.queued_calculations_count("k"), 0);

        // nobody is promoted to an abandoned slot
        manager.finish_active_calculation("k");
        assert_eq!(manager.active_calculations_count(), 0);
        assert!(manager.acquire_lock("k").await.is_acquired());
    }

    #[tokio::test]
    async fn test_idle_keys_are_forgotten() {
        time::pause();
        let manager = manager(3, Duration::from_millis(10));

        for i in 0..100 {
            let key = format!("balance_{i}");
            assert!(manager.acquire_lock(&key).await.is_acquired());
            let waiter = manager.start_calculation_or_wait_for_active_to_finish(&key);
            let release = async {
                time::sleep(Duration::from_millis(1)).await;
                manager.finish_active_calculation(&key);
            };
            let (outcome, ()) = futures::join!(waiter, release);
            assert_eq!(outcome, CalculationStart::ActiveFinished);
        }
        assert_eq!(manager.lock_keys().len(), 0);

        // a waiter that timed out leaves nothing behind either, once the owner is done
        assert!(manager.acquire_lock("fees").await.is_acquired());
        let outcome = manager
            .start_calculation_or_wait_for_active_to_finish("fees")
            .await;
        assert_eq!(outcome, CalculationStart::TimedOut);
        manager.finish_active_calculation("fees");
        assert_eq!(manager.lock_keys().len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiters_clean_up() {
        time::pause();
        let manager = manager(100, Duration::from_millis(100));
        assert!(manager.acquire_lock("rates").await.is_acquired());

        let cancelled = time::timeout(
            Duration::from_millis(10),
            manager.start_calculation_or_wait_for_active_to_finish("rates"),
        )
        .await;
        assert!(cancelled.is_err());

        let cancelled = time::timeout(Duration::from_millis(10), manager.acquire_lock("rates")).await;
        assert!(cancelled.is_err());
        assert_eq!(manager.queued_calculations_count("rates"), 0);

        // the abandoned request is not promoted
        manager.finish_active_calculation("rates");
        assert_eq!(manager.active_calculations_count(), 0);
        assert_eq!(manager.lock_keys().len(), 0);
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let manager = ResourceLockManager::default();
        manager.finish_active_calculation("unknown");
        assert_eq!(manager.active_calculations_count(), 0);

        let lock_id = manager.acquire_lock("k").await.lock_id().unwrap();
        manager.finish_active_calculation("k");
        manager.finish_active_calculation("k");
        assert!(!manager.is_the_lock_active_one("k", lock_id));
        assert_eq!(manager.active_calculations_count(), 0);
    }

    #[tokio::test]
    async fn test_finish_all_matching() {
        let manager = ResourceLockManager::default();
        for key in ["balance_BTC", "balance_ETH", "fees_BTC"] {
            assert!(manager.acquire_lock(key).await.is_acquired());
        }

        manager.finish_all_active_calculations("balance_");
        assert_eq!(manager.active_calculations_count(), 1);

        // no regex semantics: the dot is literal
        manager.finish_all_active_calculations("fees.");
        assert_eq!(manager.active_calculations_count(), 1);

        manager.finish_all_active_calculations("");
        assert_eq!(manager.active_calculations_count(), 0);
    }

    #[tokio::test]
    async fn test_finish_all_promotes_queued() {
        time::pause();
        let manager = manager(10, Duration::from_millis(100));
        assert!(manager.acquire_lock("balance_BTC").await.is_acquired());

        let queued = async { manager.acquire_lock("balance_BTC").await };
        let release = async {
            time::sleep(Duration::from_millis(1)).await;
            manager.finish_all_active_calculations("balance");
        };
        let (queued, ()) = futures::join!(queued, release);

        let lock_id = queued.lock_id().unwrap();
        assert!(manager.is_the_lock_active_one("balance_BTC", lock_id));
    }
}
