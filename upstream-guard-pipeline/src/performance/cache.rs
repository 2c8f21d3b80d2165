//! Tiered-TTL response cache with capacity-bounded eviction.
//!
//! TTL is chosen by the caller per data category at write time. A lookup
//! past `expires_at` is a miss; the entry is evicted unless stale retention
//! is enabled, in which case it stays readable through [`CacheLayer::get_stale`]
//! for `stale_ttl_ms` past expiry.
//!
//! Every hit refreshes `last_accessed_at` and bumps the access counter no
//! matter which eviction policy is active, so the policy can be switched at
//! runtime with no backfill.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use upstream_guard_core::{millis_between, CacheConfig, CacheSnapshot, Clock, EvictionPolicy};

/// Cache entry with metadata.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
    last_accessed_at: Instant,
    size_hint: usize,
    access_count: u64,
    /// Tie-breakers for entries written or read at the same instant.
    insert_seq: u64,
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    fn is_past_stale_window(&self, now: Instant, stale_ttl: Duration) -> bool {
        now > self.expires_at + stale_ttl
    }
}

/// Read-only view of a cached value handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    /// The entry's TTL had already elapsed when it was read.
    pub stale: bool,
    pub age_ms: u64,
}

/// Lifetime counters.
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

pub struct CacheLayer<V> {
    entries: DashMap<String, CacheEntry<V>>,
    max_entries: usize,
    stale_ttl: Option<Duration>,
    policy: AtomicU8,
    clock: Arc<dyn Clock>,
    counters: CacheCounters,
    seq: AtomicU64,
    /// Serializes writers so capacity checks and inserts are atomic.
    write_lock: Mutex<()>,
}

impl<V: Clone> CacheLayer<V> {
    /// `retain_stale` keeps expired entries around for fallback reads.
    pub fn new(config: &CacheConfig, retain_stale: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: config.max_cache_size.max(1),
            stale_ttl: retain_stale.then(|| Duration::from_millis(config.stale_ttl_ms)),
            policy: AtomicU8::new(encode_policy(config.cache_strategy)),
            clock,
            counters: CacheCounters::default(),
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh value for `key`, or `None` on miss or expiry.
    pub fn get(&self, key: &str) -> Option<CachedValue<V>> {
        let now = self.clock.now();

        let evict = match self.entries.get_mut(key) {
            None => {
                self.record_miss();
                return None;
            }
            Some(mut entry) => {
                if !entry.is_expired(now) {
                    entry.last_accessed_at = now;
                    entry.access_count += 1;
                    entry.access_seq = self.next_seq();

                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("upstream_guard_cache_hits_total").increment(1);
                    return Some(view(&entry, now, false));
                }

                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                self.is_evictable(&entry, now)
            }
        };

        if evict && self.evict_expired(key, now) {
            debug!("Evicting expired cache entry {}", key);
        }
        self.record_miss();
        None
    }

    /// Value for `key` even if its TTL has elapsed, as long as it is still
    /// inside the stale retention window. Does not count as a hit.
    pub fn get_stale(&self, key: &str) -> Option<CachedValue<V>> {
        let now = self.clock.now();

        let result = {
            let entry = self.entries.get(key)?;
            if self.is_evictable(&entry, now) {
                None
            } else {
                Some(view(&entry, now, entry.is_expired(now)))
            }
        };

        if result.is_none() {
            self.evict_expired(key, now);
        }
        result
    }

    /// Past expiry, or past the stale window when stale entries are retained.
    fn is_evictable(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.stale_ttl {
            Some(stale_ttl) => entry.is_past_stale_window(now, stale_ttl),
            None => entry.is_expired(now),
        }
    }

    /// Remove `key` only if the entry stored now is still evictable at `now`.
    /// A value written after the caller's read survives.
    fn evict_expired(&self, key: &str, now: Instant) -> bool {
        self.entries
            .remove_if(key, |_, entry| self.is_evictable(entry, now))
            .is_some()
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.set_with_size_hint(key, value, ttl, 0);
    }

    /// Insert or replace `key`, evicting first if the cache is full.
    pub fn set_with_size_hint(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
        size_hint: usize,
    ) {
        let key = key.into();
        let _writer = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let seq = self.next_seq();

        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                if !self.evict_one(now) {
                    break;
                }
            }
        }

        let access_count = self
            .entries
            .get(&key)
            .map(|existing| existing.access_count)
            .unwrap_or(0);

        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                last_accessed_at: now,
                size_hint,
                access_count,
                insert_seq: seq,
                access_seq: seq,
            },
        );
    }

    /// Remove one entry: an expired one if any, otherwise the policy's victim.
    fn evict_one(&self, now: Instant) -> bool {
        let victim = self
            .find_expired_key(now)
            .or_else(|| match self.policy() {
                EvictionPolicy::Lru => self.find_lru_key(),
                EvictionPolicy::Lfu => self.find_lfu_key(),
                EvictionPolicy::Fifo => self.find_fifo_key(),
            });

        match victim {
            Some(key) => {
                debug!("Evicting cache entry {} ({:?})", key, self.policy());
                self.entries.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn find_expired_key(&self, now: Instant) -> Option<String> {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .min_by_key(|entry| (entry.value().expires_at, entry.value().insert_seq))
            .map(|entry| entry.key().clone())
    }

    fn find_lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|entry| (entry.value().last_accessed_at, entry.value().access_seq))
            .map(|entry| entry.key().clone())
    }

    fn find_lfu_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|entry| (entry.value().access_count, entry.value().access_seq))
            .map(|entry| entry.key().clone())
    }

    fn find_fifo_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|entry| (entry.value().inserted_at, entry.value().insert_seq))
            .map(|entry| entry.key().clone())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Invalidates all cache entries whose key matches a predicate.
    pub fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let keys_to_remove: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        keys_to_remove
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the size hints of all entries.
    pub fn approximate_size(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().size_hint).sum()
    }

    pub fn policy(&self) -> EvictionPolicy {
        decode_policy(self.policy.load(Ordering::Relaxed))
    }

    /// Switch eviction policy; applies to the next eviction.
    pub fn set_policy(&self, policy: EvictionPolicy) {
        self.policy.store(encode_policy(policy), Ordering::Relaxed);
    }

    pub fn statistics(&self) -> CacheSnapshot {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheSnapshot {
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            size: self.entries.len(),
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("upstream_guard_cache_misses_total").increment(1);
    }
}

fn view<V: Clone>(entry: &CacheEntry<V>, now: Instant, stale: bool) -> CachedValue<V> {
    CachedValue {
        value: entry.value.clone(),
        inserted_at: entry.inserted_at,
        expires_at: entry.expires_at,
        stale,
        age_ms: millis_between(entry.inserted_at, now),
    }
}

fn encode_policy(policy: EvictionPolicy) -> u8 {
    match policy {
        EvictionPolicy::Lru => 0,
        EvictionPolicy::Lfu => 1,
        EvictionPolicy::Fifo => 2,
    }
}

fn decode_policy(raw: u8) -> EvictionPolicy {
    match raw {
        1 => EvictionPolicy::Lfu,
        2 => EvictionPolicy::Fifo,
        _ => EvictionPolicy::Lru,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upstream_guard_core::ManualClock;

    fn cache(max: usize, policy: EvictionPolicy, stale: bool) -> (CacheLayer<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = CacheConfig {
            max_cache_size: max,
            cache_strategy: policy,
            stale_ttl_ms: 10_000,
            ..Default::default()
        };
        (CacheLayer::new(&config, stale, clock.clone()), clock)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_cache_basic() {
        let (cache, _clock) = cache(10, EvictionPolicy::Lru, false);
        cache.set("key1", "value1".to_string(), TTL);

        let hit = cache.get("key1").unwrap();
        assert_eq!(hit.value, "value1");
        assert!(!hit.stale);
        assert!(cache.get("missing").is_none());

        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_cache_expiration() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru, false);
        cache.set("key1", "value1".to_string(), Duration::from_millis(100));

        clock.advance_ms(100);
        assert!(cache.get("key1").is_some());

        clock.advance_ms(1);
        assert!(cache.get("key1").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.statistics().expirations, 1);
    }

    #[test]
    fn test_expiry_cleanup_keeps_value_written_after_read() {
        for stale in [false, true] {
            let (cache, clock) = cache(10, EvictionPolicy::Lru, stale);
            cache.set("key1", "old".to_string(), Duration::from_millis(100));

            clock.advance_ms(20_000);
            let read_at = clock.now();
            // A dispatch lands a fresh value between the expiry check and the removal.
            cache.set("key1", "fresh".to_string(), TTL);

            assert!(!cache.evict_expired("key1", read_at));
            assert_eq!(cache.get("key1").unwrap().value, "fresh");
        }
    }

    #[test]
    fn test_expiry_cleanup_removes_entry_still_expired() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru, false);
        cache.set("key1", "old".to_string(), Duration::from_millis(100));

        clock.advance_ms(101);
        assert!(cache.evict_expired("key1", clock.now()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entry_retained_for_stale_reads() {
        let (cache, clock) = cache(10, EvictionPolicy::Lru, true);
        cache.set("key1", "value1".to_string(), Duration::from_millis(100));

        clock.advance_ms(500);
        assert!(cache.get("key1").is_none());

        let stale = cache.get_stale("key1").unwrap();
        assert!(stale.stale);
        assert_eq!(stale.age_ms, 500);

        clock.advance_ms(10_000);
        assert!(cache.get_stale("key1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let (cache, clock) = cache(3, EvictionPolicy::Lru, false);
        for key in ["a", "b", "c"] {
            cache.set(key, key.to_string(), TTL);
            clock.advance_ms(1);
        }
        cache.get("a");
        cache.set("d", "d".to_string(), TTL);

        assert_eq!(cache.len(), 3);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_lru_ties_broken_by_access_order() {
        let (cache, _clock) = cache(2, EvictionPolicy::Lru, false);
        cache.set("a", "a".to_string(), TTL);
        cache.set("b", "b".to_string(), TTL);
        cache.get("a");
        cache.set("c", "c".to_string(), TTL);

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_lfu_evicts_least_frequently_used() {
        let (cache, _clock) = cache(2, EvictionPolicy::Lfu, false);
        cache.set("a", "a".to_string(), TTL);
        cache.set("b", "b".to_string(), TTL);
        cache.get("a");
        cache.get("a");
        cache.get("b");
        cache.set("c", "c".to_string(), TTL);

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_fifo_ignores_access() {
        let (cache, _clock) = cache(2, EvictionPolicy::Fifo, false);
        cache.set("a", "a".to_string(), TTL);
        cache.set("b", "b".to_string(), TTL);
        cache.get("a");
        cache.set("c", "c".to_string(), TTL);

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_policy_switch_at_runtime() {
        let (cache, _clock) = cache(2, EvictionPolicy::Fifo, false);
        cache.set("a", "a".to_string(), TTL);
        cache.set("b", "b".to_string(), TTL);
        cache.get("a");
        cache.get("a");

        cache.set_policy(EvictionPolicy::Lfu);
        cache.set("c", "c".to_string(), TTL);
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_expired_entries_evicted_before_policy_victim() {
        let (cache, clock) = cache(2, EvictionPolicy::Lru, true);
        cache.set("short", "s".to_string(), Duration::from_millis(10));
        cache.set("long", "l".to_string(), TTL);
        clock.advance_ms(20);
        cache.get("long");

        cache.set("new", "n".to_string(), TTL);
        assert!(cache.get_stale("short").is_none());
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let (cache, _clock) = cache(2, EvictionPolicy::Lru, false);
        cache.set("a", "a".to_string(), TTL);
        cache.set("b", "b".to_string(), TTL);
        cache.set("a", "a2".to_string(), TTL);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap().value, "a2");
        assert_eq!(cache.statistics().evictions, 0);
    }

    #[test]
    fn test_invalidate_matching() {
        let (cache, _clock) = cache(10, EvictionPolicy::Lru, false);
        cache.set_with_size_hint("daily:600519", "x".to_string(), TTL, 100);
        cache.set_with_size_hint("daily:000001", "y".to_string(), TTL, 50);
        cache.set_with_size_hint("quote:AAPL", "z".to_string(), TTL, 25);
        assert_eq!(cache.approximate_size(), 175);

        assert_eq!(cache.invalidate_matching(|key| key.starts_with("daily:")), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate("quote:AAPL"));
        assert!(!cache.invalidate("quote:AAPL"));
    }
}
