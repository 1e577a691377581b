//! In-memory TTL cache with single-flight fetches
//!
//! `SmartCache` stores the result of an async producer under a string key and
//! serves it while fresh. Concurrent misses for the same key share one pending
//! fetch: the in-flight marker is the shared future itself, so late callers
//! await the same result instead of polling.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;

type SharedFetch<V, E> = Shared<BoxFuture<'static, Result<V, Arc<E>>>>;

/// A stored value and its timestamps
struct CacheEntry<V> {
    value: V,
    /// Monotonic store time, used for freshness
    stored_at: Instant,
    /// Wall-clock store time, for reporting
    cached_at: DateTime<Utc>,
    /// Recency tick of the last store or fresh hit
    last_used: u64,
}

/// A pending fetch that owns its key until it settles
struct InFlight<V, E> {
    generation: u64,
    fetch: SharedFetch<V, E>,
}

/// Result of peeking at the cache, including metadata about freshness
#[derive(Debug, Clone, PartialEq)]
pub struct CachedData<V> {
    /// The cached value
    pub value: V,
    /// When the value was stored
    pub cached_at: DateTime<Utc>,
    /// Whether the TTL has elapsed since the value was stored
    pub is_expired: bool,
}

/// Lifecycle state of a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Nothing stored and nothing pending
    Absent,
    /// A producer is running for this key
    InFlight,
    /// Stored and younger than the TTL
    Fresh,
    /// Stored but older than the TTL; still readable via `peek`
    Stale,
}

struct State<V, E> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V, E>>,
    next_generation: u64,
    tick: u64,
}

impl<V: Clone, E> State<V, E> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Returns the stored value if it is still fresh, marking it as used
    fn fresh_hit(&mut self, key: &str, now: Instant, ttl: Duration) -> Option<V> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        if now.saturating_duration_since(entry.stored_at) >= ttl {
            return None;
        }
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    fn owns_flight(&self, key: &str, generation: u64) -> bool {
        self.in_flight
            .get(key)
            .is_some_and(|flight| flight.generation == generation)
    }

    fn store(&mut self, key: String, value: V, max_entries: Option<NonZeroUsize>) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            cached_at: Utc::now(),
            last_used: self.next_tick(),
        };
        self.entries.insert(key, entry);

        if let Some(max) = max_entries {
            while self.entries.len() > max.get() {
                self.evict_least_recent();
            }
        }
    }

    fn evict_least_recent(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            self.entries.remove(&key);
            debug!(key = %key, "evicted least recently used entry");
        }
    }
}

fn lock<V, E>(state: &Mutex<State<V, E>>) -> MutexGuard<'_, State<V, E>> {
    // Bookkeeping never panics mid-update, so a poisoned lock still holds consistent maps.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed async cache with a uniform TTL and at most one fetch per key
///
/// Cloning a `SmartCache` yields another handle to the same storage, so one
/// instance can be handed to every collaborator that needs it.
///
/// A producer that never settles keeps its key in flight, and every caller
/// joining that key waits with it. There is no built-in timeout; wrap the
/// producer in `tokio::time::timeout` if one is needed.
pub struct SmartCache<V, E> {
    config: CacheConfig,
    state: Arc<Mutex<State<V, E>>>,
}

impl<V, E> Clone for SmartCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<V, E> fmt::Debug for SmartCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V, E> SmartCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                next_generation: 0,
                tick: 0,
            })),
        }
    }

    /// Time-to-live applied to every entry
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    fn lock(&self) -> MutexGuard<'_, State<V, E>> {
        lock(&self.state)
    }

    /// Returns the value for `key`, running `producer` only when needed
    ///
    /// # Behavior
    /// - A fresh entry is returned without calling `producer`
    /// - If a fetch for `key` is already running, its result is shared
    /// - Otherwise `producer` runs once; a success is stored, a failure is not
    ///
    /// Every caller sharing a failed fetch receives the same error.
    pub async fn get<F, Fut>(&self, key: &str, producer: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let fetch = {
            let mut state = self.lock();

            if let Some(value) = state.fresh_hit(key, Instant::now(), self.config.ttl) {
                debug!(key, "cache hit");
                return Ok(value);
            }

            let pending = state
                .in_flight
                .get(key)
                .map(|flight| (flight.generation, flight.fetch.clone()));

            match pending {
                Some((generation, fetch)) => {
                    debug!(key, generation, "joining in-flight fetch");
                    fetch
                }
                None => {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    let fetch = self.fetch(key.to_owned(), generation, producer);
                    state.in_flight.insert(
                        key.to_owned(),
                        InFlight {
                            generation,
                            fetch: fetch.clone(),
                        },
                    );
                    debug!(key, generation, "cache miss, fetching");
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Wraps `producer` so the fetch records its own outcome when it settles
    fn fetch<F, Fut>(&self, key: String, generation: u64, producer: F) -> SharedFetch<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let max_entries = self.config.max_entries;

        async move {
            let settled = AssertUnwindSafe(async move { producer().await })
                .catch_unwind()
                .await;

            let mut guard = lock(&state);
            let owned = guard.owns_flight(&key, generation);
            if owned {
                guard.in_flight.remove(&key);
            }

            // A panicking producer releases the key before the panic reaches the callers.
            let outcome = match settled {
                Ok(outcome) => outcome.map_err(Arc::new),
                Err(payload) => {
                    drop(guard);
                    warn!(key = %key, generation, "producer panicked, key released");
                    panic::resume_unwind(payload);
                }
            };

            // A fetch superseded by invalidate/clear answers its own callers only.
            if !owned {
                debug!(key = %key, generation, "fetch superseded, result not cached");
                return outcome;
            }

            match &outcome {
                Ok(value) => {
                    guard.store(key.clone(), value.clone(), max_entries);
                    debug!(key = %key, generation, "stored fetched value");
                }
                Err(_) => debug!(key = %key, generation, "fetch failed, nothing cached"),
            }
            outcome
        }
        .boxed()
        .shared()
    }

    /// Removes the entry and any pending fetch for `key`
    pub fn invalidate(&self, key: &str) {
        let mut state = self.lock();
        state.entries.remove(key);
        let flight = state.in_flight.remove(key);
        drop(state);
        drop(flight);
        debug!(key, "invalidated");
    }

    /// Removes every key starting with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut state = self.lock();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        let pending: Vec<String> = state
            .in_flight
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        let flights: Vec<_> = pending
            .iter()
            .filter_map(|key| state.in_flight.remove(key))
            .collect();
        drop(state);
        debug!(prefix, dropped_fetches = flights.len(), "invalidated prefix");
    }

    /// Removes all entries and pending fetches
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        let flights = std::mem::take(&mut state.in_flight);
        drop(state);
        debug!(dropped_fetches = flights.len(), "cache cleared");
    }

    /// Reads the stored value for `key` without fetching, fresh or not
    pub fn peek(&self, key: &str) -> Option<CachedData<V>> {
        let state = self.lock();
        let entry = state.entries.get(key)?;
        Some(CachedData {
            value: entry.value.clone(),
            cached_at: entry.cached_at,
            is_expired: entry.stored_at.elapsed() >= self.config.ttl,
        })
    }

    /// Reports where `key` is in its lifecycle
    pub fn state(&self, key: &str) -> KeyState {
        let state = self.lock();
        if state.in_flight.contains_key(key) {
            return KeyState::InFlight;
        }
        match state.entries.get(key) {
            None => KeyState::Absent,
            Some(entry) if entry.stored_at.elapsed() < self.config.ttl => KeyState::Fresh,
            Some(_) => KeyState::Stale,
        }
    }

    /// Number of stored entries, fresh or stale
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no entries are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    type TestCache = SmartCache<String, String>;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn create_test_cache(ttl_ms: u64) -> TestCache {
        SmartCache::new(CacheConfig::with_ttl(ms(ttl_ms)))
    }

    /// Producer that counts its invocations and settles after `delay`
    fn producer(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        outcome: Result<&'static str, &'static str>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<String, String>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(delay).await;
                outcome.map(str::to_string).map_err(str::to_string)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_skips_producer() {
        let cache = create_test_cache(1_000);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let value = cache.get("k", producer(&first, ms(5), Ok("one"))).await.unwrap();
        let again = cache.get("k", producer(&second, ms(5), Ok("two"))).await.unwrap();

        assert_eq!(value, "one");
        assert_eq!(again, "one");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_triggers_refetch() {
        let cache = create_test_cache(100);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("k", producer(&calls, ms(0), Ok("old"))).await.unwrap();
        advance(ms(99)).await;
        assert_eq!(cache.state("k"), KeyState::Fresh);

        advance(ms(1)).await;
        assert_eq!(cache.state("k"), KeyState::Stale);

        let value = cache.get("k", producer(&calls, ms(0), Ok("new"))).await.unwrap();
        assert_eq!(value, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_fetch() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let results = futures::future::join_all(
            (0..5).map(|_| cache.get("k", producer(&calls, ms(20), Ok("shared")))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 5);
        for result in results {
            assert_eq!(result.unwrap(), "shared");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_joined_caller() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get("k", producer(&calls, ms(5), Err("network error"))),
            cache.get("k", producer(&calls, ms(5), Ok("unused"))),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap_err().as_str(), "network error");
        assert_eq!(b.unwrap_err().as_str(), "network error");
        assert_eq!(cache.state("k"), KeyState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_cached() {
        let cache = create_test_cache(1_000);
        let failing = Arc::new(AtomicUsize::new(0));
        let ok = Arc::new(AtomicUsize::new(0));

        let err = cache
            .get("k", producer(&failing, ms(5), Err("boom")))
            .await
            .unwrap_err();
        assert_eq!(*err, "boom");

        let value = cache.get("k", producer(&ok, ms(0), Ok("recovered"))).await.unwrap();
        assert_eq!(value, "recovered");
        assert_eq!(ok.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_stale_entry() {
        let cache = create_test_cache(100);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("k", producer(&calls, ms(0), Ok("old"))).await.unwrap();
        advance(ms(150)).await;
        assert!(cache.get("k", producer(&calls, ms(0), Err("down"))).await.is_err());

        let cached = cache.peek("k").expect("stale entry should survive a failed refresh");
        assert_eq!(cached.value, "old");
        assert!(cached.is_expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("k", producer(&calls, ms(0), Ok("first"))).await.unwrap();
        cache.invalidate("k");
        assert_eq!(cache.state("k"), KeyState::Absent);

        let value = cache.get("k", producer(&calls, ms(0), Ok("second"))).await.unwrap();
        assert_eq!(value, "second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_missing_key_is_noop() {
        let cache = create_test_cache(1_000);
        cache.invalidate("missing");
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_every_key() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            cache.get(key, producer(&calls, ms(0), Ok("v"))).await.unwrap();
        }
        assert_eq!(cache.len(), 3);

        cache.clear();

        assert!(cache.is_empty());
        for key in ["a", "b", "c"] {
            assert_eq!(cache.state(key), KeyState::Absent);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_isolated() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("b", producer(&calls, ms(0), Ok("b-value"))).await.unwrap();

        let mut pending_a = Box::pin(cache.get("a", producer(&calls, ms(50), Ok("a-value"))));
        assert!(futures::poll!(pending_a.as_mut()).is_pending());
        assert_eq!(cache.state("a"), KeyState::InFlight);
        assert_eq!(cache.state("b"), KeyState::Fresh);

        cache.invalidate("a");
        assert_eq!(cache.state("b"), KeyState::Fresh);
        assert_eq!(cache.peek("b").unwrap().value, "b-value");

        assert_eq!(pending_a.await.unwrap(), "a-value");
        assert_eq!(cache.state("a"), KeyState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_fetch_discards_result() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut leader = Box::pin(cache.get("k", producer(&calls, ms(20), Ok("before"))));
        assert!(futures::poll!(leader.as_mut()).is_pending());

        cache.invalidate("k");
        let value = cache.get("k", producer(&calls, ms(5), Ok("after"))).await.unwrap();
        assert_eq!(value, "after");

        // The superseded fetch still answers its own caller but leaves the newer entry alone.
        assert_eq!(leader.await.unwrap(), "before");
        assert_eq!(cache.peek("k").unwrap().value, "after");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_fetch_discards_result() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut leader = Box::pin(cache.get("k", producer(&calls, ms(20), Ok("before"))));
        assert!(futures::poll!(leader.as_mut()).is_pending());

        cache.clear();
        assert_eq!(cache.state("k"), KeyState::Absent);

        assert_eq!(leader.await.unwrap(), "before");
        assert_eq!(cache.state("k"), KeyState::Absent);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix_during_fetch_discards_result() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut orders = Box::pin(cache.get("orders:u1", producer(&calls, ms(20), Ok("o"))));
        let mut products = Box::pin(cache.get("products:all", producer(&calls, ms(20), Ok("p"))));
        assert!(futures::poll!(orders.as_mut()).is_pending());
        assert!(futures::poll!(products.as_mut()).is_pending());

        cache.invalidate_prefix("orders:");
        assert_eq!(cache.state("orders:u1"), KeyState::Absent);
        assert_eq!(cache.state("products:all"), KeyState::InFlight);

        let (orders, products) = tokio::join!(orders, products);
        assert_eq!(orders.unwrap(), "o");
        assert_eq!(products.unwrap(), "p");
        assert_eq!(cache.state("orders:u1"), KeyState::Absent);
        assert_eq!(cache.state("products:all"), KeyState::Fresh);
    }

    async fn exploding_producer() -> Result<String, String> {
        panic!("producer exploded")
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_producer_releases_key() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("k", exploding_producer).await }
        });
        let err = task.await.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(cache.state("k"), KeyState::Absent);

        let value = cache.get("k", producer(&calls, ms(0), Ok("recovered"))).await.unwrap();
        assert_eq!(value, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state("k"), KeyState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_is_finished_by_next_caller() {
        let cache = create_test_cache(1_000);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let timed_out =
            tokio::time::timeout(ms(1), cache.get("k", producer(&first, ms(20), Ok("v")))).await;
        assert!(timed_out.is_err());
        assert_eq!(cache.state("k"), KeyState::InFlight);

        let value = cache.get("k", producer(&second, ms(0), Ok("other"))).await.unwrap();
        assert_eq!(value, "v");
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(cache.state("k"), KeyState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_entries_evicts_least_recently_used() {
        let config = CacheConfig::with_ttl(ms(1_000)).max_entries(NonZeroUsize::new(2).unwrap());
        let cache: TestCache = SmartCache::new(config);
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get("a", producer(&calls, ms(0), Ok("a"))).await.unwrap();
        cache.get("b", producer(&calls, ms(0), Ok("b"))).await.unwrap();
        // Touch "a" so "b" becomes the oldest
        cache.get("a", producer(&calls, ms(0), Ok("unused"))).await.unwrap();
        cache.get("c", producer(&calls, ms(0), Ok("c"))).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.state("a"), KeyState::Fresh);
        assert_eq!(cache.state("b"), KeyState::Absent);
        assert_eq!(cache.state("c"), KeyState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix_only_touches_matching_keys() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        for key in ["orders:u1:2024", "orders:u1:2025", "products:all"] {
            cache.get(key, producer(&calls, ms(0), Ok("v"))).await.unwrap();
        }

        cache.invalidate_prefix("orders:u1:");

        assert_eq!(cache.state("orders:u1:2024"), KeyState::Absent);
        assert_eq!(cache.state("orders:u1:2025"), KeyState::Absent);
        assert_eq!(cache.state("products:all"), KeyState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_records_cached_at() {
        let cache = create_test_cache(1_000);
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(cache.peek("k").is_none());

        let before = Utc::now();
        cache.get("k", producer(&calls, ms(0), Ok("v"))).await.unwrap();
        let after = Utc::now();

        let cached = cache.peek("k").unwrap();
        assert!(!cached.is_expired);
        assert!(cached.cached_at >= before && cached.cached_at <= after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_still_single_flight() {
        let cache = create_test_cache(0);
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get("k", producer(&calls, ms(10), Ok("v"))),
            cache.get("k", producer(&calls, ms(10), Ok("v"))),
        );
        assert_eq!(a.unwrap(), "v");
        assert_eq!(b.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state("k"), KeyState::Stale);

        cache.get("k", producer(&calls, ms(0), Ok("v"))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
