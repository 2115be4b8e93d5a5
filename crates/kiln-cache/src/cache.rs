//! Concurrent memoizing cache with validated-value and expiry-envelope lookups.

use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use kiln_time::Clock;
use kiln_time::SystemClock;
use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

use crate::envelope::Expires;
use crate::error::InvalidConfigSnafu;
use crate::error::Result;
use crate::verified::StoreDecision;
use crate::verified::decide_store;
use crate::verified::eviction_count;
use crate::verified::is_entry_stale;
use crate::verified::is_envelope_expired;

/// Default bound on the number of cached entries.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;

fn default_max_entries() -> usize {
    DEFAULT_MAX_CACHE_ENTRIES
}

/// Eviction policy for [`ExpiringCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries; the oldest entries are evicted beyond this.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Entries older than this (measured with the cache's clock) are treated as absent.
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_CACHE_ENTRIES,
            max_age_ms: None,
        }
    }
}

/// Point-in-time counters for a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the store.
    pub hits: u64,
    /// Lookups that had to run `compute`.
    pub misses: u64,
    /// Values written to the store.
    pub stores: u64,
    /// Entries removed by the size or age bound.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

struct Slot<V> {
    value: V,
    inserted_at_ms: u64,
    sequence: u64,
}

/// Memoizing key/value cache.
///
/// Backed by a sharded concurrent map. Entries are written whole, so readers never
/// observe a partially written value. The read-check-then-write sequence is not
/// transactional: concurrent misses on one key may each compute and the last write wins.
pub struct ExpiringCache<K, V> {
    entries: DashMap<K, Slot<V>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    next_sequence: AtomicU64,
    counters: Counters,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache whose age bound is measured with the wall clock.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache whose age bound is measured with `clock`.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.max_entries == 0 {
            return InvalidConfigSnafu {
                reason: "max_entries must be greater than zero",
            }
            .fail();
        }
        Ok(Self {
            entries: DashMap::new(),
            config,
            clock,
            next_sequence: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    /// Validated-value lookup with an infallible `compute`.
    ///
    /// See [`try_get_or_compute`](Self::try_get_or_compute).
    pub fn get_or_compute<F, C>(&self, validate: F, compute: C, key: K) -> Option<V>
    where
        F: Fn(&V) -> bool,
        C: FnOnce(&K) -> Option<V>,
    {
        match self.try_get_or_compute(validate, |k| Ok::<_, Infallible>(compute(k)), key) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Validated-value lookup.
    ///
    /// - A stored value accepted by `validate` is returned without touching the store.
    /// - Otherwise `compute` runs. `None` is returned as-is and never stored.
    /// - A computed value accepted by `validate` is stored and returned.
    /// - A computed value rejected by `validate` is returned but not stored.
    ///
    /// Errors from `compute` propagate and leave the store untouched.
    pub fn try_get_or_compute<E, F, C>(&self, validate: F, compute: C, key: K) -> Result<Option<V>, E>
    where
        F: Fn(&V) -> bool,
        C: FnOnce(&K) -> Result<Option<V>, E>,
    {
        if let Some(existing) = self.lookup(&key)
            && decide_store(true, validate(&existing)) == StoreDecision::ReturnAndStore
        {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(existing));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let computed = compute(&key)?;
        let accepted = computed.as_ref().is_some_and(&validate);
        if decide_store(computed.is_some(), accepted) == StoreDecision::ReturnAndStore
            && let Some(value) = &computed
        {
            self.store(key, value.clone());
        }
        Ok(computed)
    }

    /// Remove `key`, returning whether it was present.
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including any not yet aged out.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` currently has a live (not aged out) entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Eviction policy in force.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Copy out a live entry. Aged-out entries are removed and reported as absent.
    fn lookup(&self, key: &K) -> Option<V> {
        let now_ms = self.clock.now_ms();
        let slot = self.entries.get(key)?;
        let stale = is_entry_stale(slot.inserted_at_ms, self.config.max_age_ms, now_ms);
        let value = slot.value.clone();
        drop(slot);

        if stale {
            let max_age_ms = self.config.max_age_ms;
            if self.entries.remove_if(key, |_, slot| is_entry_stale(slot.inserted_at_ms, max_age_ms, now_ms)).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        Some(value)
    }

    fn store(&self, key: K, value: V) {
        let slot = Slot {
            value,
            inserted_at_ms: self.clock.now_ms(),
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(key, slot);
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        self.enforce_capacity();
    }

    fn enforce_capacity(&self) {
        let excess = eviction_count(self.entries.len(), self.config.max_entries);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<((u64, u64), K)> = self
            .entries
            .iter()
            .map(|entry| ((entry.value().inserted_at_ms, entry.value().sequence), entry.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(age, _)| *age);

        for (_, key) in by_age.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        trace!(evicted = excess, max_entries = self.config.max_entries, "cache over capacity");
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Expires,
{
    /// Expiry-envelope lookup with an infallible `compute`.
    ///
    /// See [`try_get_or_compute_with_expiry`](Self::try_get_or_compute_with_expiry).
    pub fn get_or_compute_with_expiry<U, W, C>(&self, unwrap: W, compute: C, key: K, clock: &dyn Clock) -> U
    where
        W: Fn(&V) -> U,
        C: FnOnce(&K) -> V,
    {
        match self.try_get_or_compute_with_expiry(unwrap, |k| Ok::<_, Infallible>(compute(k)), key, clock) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Expiry-envelope lookup.
    ///
    /// A stored envelope is served while it has no expiry or its expiry is at or after
    /// `clock.now_ms()`. Otherwise `compute` runs and its envelope is stored
    /// unconditionally, replacing any previous entry, and `unwrap` of it is returned.
    pub fn try_get_or_compute_with_expiry<U, E, W, C>(
        &self,
        unwrap: W,
        compute: C,
        key: K,
        clock: &dyn Clock,
    ) -> Result<U, E>
    where
        W: Fn(&V) -> U,
        C: FnOnce(&K) -> Result<V, E>,
    {
        if let Some(existing) = self.lookup(&key)
            && !is_envelope_expired(existing.expires_at_ms(), clock.now_ms())
        {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(unwrap(&existing));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let fresh = compute(&key)?;
        let result = unwrap(&fresh);
        self.store(key, fresh);
        Ok(result)
    }
}

impl<K: Eq + Hash, V> fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use kiln_time::SimulatedClock;

    use super::*;
    use crate::Envelope;

    fn cache<V: Clone>() -> ExpiringCache<u64, V> {
        ExpiringCache::new(CacheConfig::default()).unwrap()
    }

    fn even_only(v: &u64) -> bool {
        v % 2 == 0
    }

    fn identity_up_to_100(k: &u64) -> Option<u64> {
        if *k > 100 { None } else { Some(*k) }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = CacheConfig {
            max_entries: 0,
            max_age_ms: None,
        };
        assert!(ExpiringCache::<u64, u64>::new(config).is_err());
    }

    #[test]
    fn validated_lookup_scenario() {
        let cache = cache::<u64>();

        // Odd values fail validation: returned, never retained.
        assert_eq!(cache.get_or_compute(even_only, identity_up_to_100, 1), Some(1));
        assert!(!cache.contains_key(&1));

        assert_eq!(cache.get_or_compute(even_only, identity_up_to_100, 2), Some(2));
        assert!(cache.contains_key(&2));

        assert_eq!(cache.get_or_compute(even_only, identity_up_to_100, 101), None);
        assert!(!cache.contains_key(&101));

        assert_eq!(cache.get_or_compute(even_only, identity_up_to_100, 4), Some(4));
        assert!(cache.contains_key(&4));

        assert_eq!(cache.get_or_compute(even_only, |_| panic!("2 must come from the store"), 2), Some(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn accepted_value_is_not_recomputed() {
        let cache = cache::<u64>();
        let calls = AtomicUsize::new(0);
        for _ in 0..5 {
            let value = cache.get_or_compute(
                even_only,
                |k| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some(k * 2)
                },
                3,
            );
            assert_eq!(value, Some(6));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 4);
    }

    #[test]
    fn none_is_recomputed_every_time() {
        let cache = cache::<u64>();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache.get_or_compute(
                even_only,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    None
                },
                7,
            );
            assert_eq!(value, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[test]
    fn stored_value_that_stops_validating_is_recomputed() {
        let cache = cache::<u64>();
        cache.get_or_compute(|_| true, |_| Some(10), 1);
        let value = cache.get_or_compute(|v| *v > 10, |_| Some(20), 1);
        assert_eq!(value, Some(20));
        assert_eq!(cache.get_or_compute(|v| *v > 10, |_| panic!("cached"), 1), Some(20));
    }

    #[test]
    fn compute_error_propagates_and_stores_nothing() {
        let cache = cache::<u64>();
        let result: std::result::Result<Option<u64>, &str> =
            cache.try_get_or_compute(even_only, |_| Err("backend down"), 2);
        assert_eq!(result, Err("backend down"));
        assert!(cache.is_empty());
    }

    fn function_a(k: &u64) -> Envelope<String> {
        Envelope::expiring(format!("a{k}"), k * 1_000)
    }

    fn function_b(k: &u64) -> Envelope<String> {
        Envelope::permanent(format!("b{k}"))
    }

    fn payload(envelope: &Envelope<String>) -> String {
        envelope.payload.clone()
    }

    #[test]
    fn expiry_lookup_scenario() {
        let cache = cache::<Envelope<String>>();
        let clock = SimulatedClock::new(0);

        for key in 1..=3 {
            assert_eq!(cache.get_or_compute_with_expiry(payload, function_a, key, &clock), format!("a{key}"));
        }

        clock.freeze(999);
        for key in 1..=3 {
            assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, key, &clock), format!("a{key}"));
        }

        clock.freeze(1_001);
        assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, 1, &clock), "b1");
        assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, 2, &clock), "a2");
        assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, 3, &clock), "a3");

        clock.freeze(2_001);
        assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, 1, &clock), "b1");
        assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, 2, &clock), "b2");
        assert_eq!(cache.get_or_compute_with_expiry(payload, function_b, 3, &clock), "a3");
    }

    #[test]
    fn permanent_envelope_survives_any_clock() {
        let cache = cache::<Envelope<String>>();
        let clock = SimulatedClock::new(0);
        cache.get_or_compute_with_expiry(payload, function_b, 9, &clock);

        clock.freeze(u64::MAX);
        let value = cache.get_or_compute_with_expiry(payload, |_| panic!("never expires"), 9, &clock);
        assert_eq!(value, "b9");
    }

    #[test]
    fn recomputed_envelope_overwrites_even_if_already_expired() {
        let cache = cache::<Envelope<u64>>();
        let clock = SimulatedClock::new(100);
        let unwrap = |e: &Envelope<u64>| e.payload;

        // Stored unconditionally, even though it is already in the past.
        assert_eq!(cache.get_or_compute_with_expiry(unwrap, |_| Envelope::expiring(1, 50), 0, &clock), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_or_compute_with_expiry(unwrap, |_| Envelope::expiring(2, 500), 0, &clock), 2);
        assert_eq!(cache.get_or_compute_with_expiry(unwrap, |_| Envelope::expiring(3, 500), 0, &clock), 2);
    }

    #[test]
    fn expiry_compute_error_keeps_previous_entry() {
        let cache = cache::<Envelope<u64>>();
        let clock = SimulatedClock::new(0);
        let unwrap = |e: &Envelope<u64>| e.payload;
        cache.get_or_compute_with_expiry(unwrap, |_| Envelope::expiring(1, 10), 0, &clock);

        clock.freeze(11);
        let result: std::result::Result<u64, String> =
            cache.try_get_or_compute_with_expiry(unwrap, |_| Err("boom".to_string()), 0, &clock);
        assert!(result.is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_entries() {
        let clock = SimulatedClock::new(0);
        let config = CacheConfig {
            max_entries: 2,
            max_age_ms: None,
        };
        let cache: ExpiringCache<u64, u64> = ExpiringCache::with_clock(config, Arc::new(clock.clone())).unwrap();

        for key in [1, 2, 3] {
            clock.bump(1);
            cache.get_or_compute(|_| true, |k| Some(*k), key);
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key(&1));
        assert!(cache.contains_key(&2));
        assert!(cache.contains_key(&3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn capacity_keeps_newest_when_clock_is_frozen() {
        let config = CacheConfig {
            max_entries: 1,
            max_age_ms: None,
        };
        let cache: ExpiringCache<u64, u64> =
            ExpiringCache::with_clock(config, Arc::new(SimulatedClock::new(0))).unwrap();
        cache.get_or_compute(|_| true, |k| Some(*k), 1);
        cache.get_or_compute(|_| true, |k| Some(*k), 2);
        assert!(cache.contains_key(&2));
        assert!(!cache.contains_key(&1));
    }

    #[test]
    fn aged_out_entry_is_recomputed() {
        let clock = SimulatedClock::new(0);
        let config = CacheConfig {
            max_entries: 10,
            max_age_ms: Some(100),
        };
        let cache: ExpiringCache<u64, u64> = ExpiringCache::with_clock(config, Arc::new(clock.clone())).unwrap();
        cache.get_or_compute(|_| true, |_| Some(1), 0);

        clock.freeze(100);
        assert_eq!(cache.get_or_compute(|_| true, |_| Some(2), 0), Some(1));
        clock.freeze(101);
        assert_eq!(cache.get_or_compute(|_| true, |_| Some(2), 0), Some(2));
    }

    #[test]
    fn concurrent_misses_leave_one_whole_value() {
        let cache: Arc<ExpiringCache<u64, Vec<u64>>> = Arc::new(cache());
        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for _ in 0..100 {
                        let value = cache.get_or_compute(|v| v.len() == 64, |_| Some(vec![worker; 64]), 42);
                        let value = value.unwrap_or_default();
                        assert!(value.iter().all(|x| *x == value[0]), "torn value observed");
                    }
                });
            }
        });
        let stored = cache.get_or_compute(|_| true, |_| None, 42).unwrap_or_default();
        assert_eq!(stored.len(), 64);
        assert!(stored.iter().all(|x| *x == stored[0]));
    }
}
