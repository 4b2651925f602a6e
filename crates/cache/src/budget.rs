//! Byte-budgeted LRU cache for decoded resources
//!
//! Holds shared [`Resource`]s keyed by owner identity and keeps the sum of
//! their footprints under a fixed byte budget by evicting the least recently
//! used entries. Every entry that leaves the cache, through eviction or
//! explicit removal, is reported to an [`EvictionListener`] and then released
//! exactly once.

use crate::listener::{EvictionListener, EvictionReason, NoopListener};
use crate::lru::LruList;
use crate::resource::{CacheKey, Resource};
use parking_lot::Mutex;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fraction of the budget freed on top of the overshoot by an expunge pass.
const HEADROOM_DIVISOR: u64 = 20;

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the cache whose listener is running on this thread, if any.
    static LISTENER_OWNER: Cell<usize> = const { Cell::new(0) };
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of entries currently in the cache
    pub entry_count: usize,

    /// Sum of the footprints of all live entries (bytes)
    pub current_bytes: u64,

    /// Byte budget
    pub max_bytes: u64,

    /// Number of `get` calls that found an entry
    pub hits: u64,

    /// Number of `get` calls that found nothing
    pub misses: u64,

    /// Number of `put` calls
    pub inserts: u64,

    /// Number of entries evicted due to the budget
    pub evictions: u64,

    /// Number of entries removed explicitly
    pub removals: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0, may exceed 1.0 transiently)
    pub fn memory_utilization(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.current_bytes as f64 / self.max_bytes as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    inserts: u64,
    evictions: u64,
    removals: u64,
}

struct CacheState<K, V> {
    entries: LruList<K, V>,
    counters: Counters,
}

/// Access-ordered, byte-budgeted cache.
///
/// `get`, `put`, `remove` and `expunge_stale_entries` each run under a single
/// critical section that covers the whole operation, listener calls included.
/// `current_bytes` is mirrored in an atomic so budget queries never block.
///
/// # Example
///
/// ```
/// use media_viewer_cache::{BudgetedCache, Resource};
/// use std::sync::Arc;
///
/// struct Buffer(Vec<u8>);
///
/// impl Resource for Buffer {
///     fn physical_bytes(&self) -> u64 {
///         self.0.len() as u64
///     }
///     fn release(&self) {}
/// }
///
/// let cache = BudgetedCache::new(1000);
/// cache.put("a", Arc::new(Buffer(vec![0; 400])));
/// cache.put("b", Arc::new(Buffer(vec![0; 400])));
/// cache.put("c", Arc::new(Buffer(vec![0; 400])));
///
/// assert!(!cache.contains(&"a"));
/// assert_eq!(cache.current_bytes(), 800);
/// ```
pub struct BudgetedCache<K, V> {
    id: usize,
    max_bytes: u64,
    current_bytes: AtomicU64,
    state: Mutex<CacheState<K, V>>,
    listener: Box<dyn EvictionListener<K, V>>,
}

impl<K: CacheKey, V: Resource> BudgetedCache<K, V> {
    /// Create a cache with the given byte budget and no eviction listener.
    pub fn new(max_bytes: u64) -> Self {
        Self::with_listener(max_bytes, NoopListener)
    }

    /// Create a cache with the given byte budget and eviction listener.
    pub fn with_listener<L>(max_bytes: u64, listener: L) -> Self
    where
        L: EvictionListener<K, V> + 'static,
    {
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            max_bytes,
            current_bytes: AtomicU64::new(0),
            state: Mutex::new(CacheState {
                entries: LruList::new(),
                counters: Counters::default(),
            }),
            listener: Box::new(listener),
        }
    }

    /// Returns the live resource for `key` and marks it most recently used.
    ///
    /// Never triggers loading.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.assert_not_in_listener();
        let mut state = self.state.lock();
        match state.entries.get_and_promote(key) {
            Some(value) => {
                state.counters.hits += 1;
                Some(value)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// Returns the resource for `key` without touching its recency or the
    /// hit/miss counters.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.assert_not_in_listener();
        self.state.lock().entries.peek(key)
    }

    /// Check if a key is cached without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.assert_not_in_listener();
        self.state.lock().entries.contains(key)
    }

    /// Insert or replace the resource for `key`.
    ///
    /// Before the new entry is linked, least recently used entries are
    /// evicted if the projected size (current size minus the replaced entry
    /// plus the new one) is over budget. The previous resource for the same
    /// key, if any, is returned to the caller and is *not* released.
    pub fn put(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        self.assert_not_in_listener();
        let bytes = value.physical_bytes();
        let mut state = self.state.lock();
        state.counters.inserts += 1;

        let previous = state.entries.remove(&key).map(|(previous, previous_bytes)| {
            self.current_bytes.fetch_sub(previous_bytes, Ordering::AcqRel);
            previous
        });

        let projected = self.current_bytes.load(Ordering::Acquire) + bytes;
        if projected > self.max_bytes {
            self.evict_locked(&mut state, projected);
        }

        state.entries.push_front(key, value, bytes);
        self.current_bytes.fetch_add(bytes, Ordering::AcqRel);
        previous
    }

    /// Remove the entry for `key`, if any.
    ///
    /// The listener is invoked in every case, with `None` when the key was
    /// not cached. A removed resource is released before this returns; the
    /// returned handle must not be used to read pixel data.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.assert_not_in_listener();
        let mut state = self.state.lock();
        let removed = state.entries.remove(key);

        match &removed {
            Some((value, bytes)) => {
                self.current_bytes.fetch_sub(*bytes, Ordering::AcqRel);
                state.counters.removals += 1;
                self.notify(key, Some(value), EvictionReason::Removed);
                value.release();
            }
            None => self.notify(key, None, EvictionReason::Removed),
        }

        removed.map(|(value, _)| value)
    }

    /// Evict least recently used entries if the cache is over budget.
    ///
    /// Frees at least `max_bytes / 20 + (current_bytes - max_bytes)` bytes;
    /// the entry that crosses that target is evicted too. Returns the number
    /// of evicted entries.
    pub fn expunge_stale_entries(&self) -> usize {
        self.assert_not_in_listener();
        let mut state = self.state.lock();
        let current = self.current_bytes.load(Ordering::Acquire);
        if current > self.max_bytes {
            self.evict_locked(&mut state, current)
        } else {
            0
        }
    }

    /// Evict least recently used entries until at least `bytes` have been
    /// freed or the cache is empty, whatever the budget.
    ///
    /// Entries go through the listener and are released exactly as in a
    /// budget-driven pass. Returns the number of evicted entries.
    pub fn evict_to_free(&self, bytes: u64) -> usize {
        self.assert_not_in_listener();
        if bytes == 0 {
            return 0;
        }
        let mut state = self.state.lock();
        let (evicted, freed) = self.pop_lru_while(&mut state, |freed| freed < bytes);
        if evicted > 0 {
            tracing::debug!(evicted, freed, requested = bytes, "freed cache memory on demand");
        }
        evicted
    }

    /// Remove every entry, notifying the listener for each.
    pub fn clear(&self) {
        self.assert_not_in_listener();
        let mut state = self.state.lock();
        for (key, value, bytes) in state.entries.drain() {
            self.current_bytes.fetch_sub(bytes, Ordering::AcqRel);
            state.counters.removals += 1;
            self.notify(&key, Some(&value), EvictionReason::Removed);
            value.release();
        }
    }

    /// `true` while the cache is under its budget.
    pub fn is_memory_available(&self) -> bool {
        self.current_bytes() < self.max_bytes
    }

    /// Sum of the footprints of all live entries.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }

    /// The byte budget fixed at construction.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes left before the budget is reached.
    pub fn headroom(&self) -> u64 {
        self.max_bytes.saturating_sub(self.current_bytes())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.assert_not_in_listener();
        self.state.lock().entries.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.assert_not_in_listener();
        self.state.lock().entries.keys_oldest_first()
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.assert_not_in_listener();
        let state = self.state.lock();
        CacheStats {
            entry_count: state.entries.len(),
            current_bytes: self.current_bytes(),
            max_bytes: self.max_bytes,
            hits: state.counters.hits,
            misses: state.counters.misses,
            inserts: state.counters.inserts,
            evictions: state.counters.evictions,
            removals: state.counters.removals,
        }
    }

    /// Evicts from the tail until more than the target has been freed.
    ///
    /// `size` is the size the target is computed against: the current size
    /// for an expunge pass, the projected size for a `put`.
    fn evict_locked(&self, state: &mut CacheState<K, V>, size: u64) -> usize {
        let target = self.max_bytes / HEADROOM_DIVISOR + size.saturating_sub(self.max_bytes);
        let (evicted, freed) = self.pop_lru_while(state, |freed| freed <= target);

        if evicted > 0 {
            tracing::debug!(
                evicted,
                freed,
                target,
                current = self.current_bytes(),
                max = self.max_bytes,
                "expunged stale cache entries"
            );
        }
        evicted
    }

    /// Pops tail entries while `more(freed_so_far)` holds. Returns the
    /// number of evicted entries and the bytes freed.
    fn pop_lru_while(
        &self,
        state: &mut CacheState<K, V>,
        mut more: impl FnMut(u64) -> bool,
    ) -> (usize, u64) {
        let mut freed = 0u64;
        let mut evicted = 0usize;

        while more(freed) {
            let Some((key, value, bytes)) = state.entries.pop_back() else {
                break;
            };
            self.current_bytes.fetch_sub(bytes, Ordering::AcqRel);
            freed += bytes;
            evicted += 1;
            state.counters.evictions += 1;

            tracing::trace!(?key, bytes, "evicting cache entry");
            self.notify(&key, Some(&value), EvictionReason::Capacity);
            value.release();
        }
        (evicted, freed)
    }

    fn notify(&self, key: &K, value: Option<&Arc<V>>, reason: EvictionReason) {
        let outer = LISTENER_OWNER.with(|owner| owner.replace(self.id));
        let _restore = RestoreOwner(outer);
        self.listener.on_evicted(key, value, reason);
    }

    fn assert_not_in_listener(&self) {
        let reentrant = LISTENER_OWNER.with(|owner| owner.get() == self.id);
        assert!(
            !reentrant,
            "BudgetedCache re-entered from its own eviction listener; \
             listeners must not call back into the cache that notifies them"
        );
    }
}

/// Restores the previous listener owner when dropped, also on unwind.
struct RestoreOwner(usize);

impl Drop for RestoreOwner {
    fn drop(&mut self) {
        LISTENER_OWNER.with(|owner| owner.set(self.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::Blob;
    use parking_lot::Mutex as PlMutex;
    use rand::Rng;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;

    type Log = Arc<PlMutex<Vec<(&'static str, Option<u64>, EvictionReason)>>>;

    fn recording_cache(max_bytes: u64) -> (BudgetedCache<&'static str, Blob>, Log) {
        let log: Log = Arc::new(PlMutex::new(Vec::new()));
        let sink = log.clone();
        let cache = BudgetedCache::with_listener(
            max_bytes,
            move |key: &&'static str, value: Option<&Arc<Blob>>, reason: EvictionReason| {
                sink.lock().push((*key, value.map(|v| v.bytes), reason));
            },
        );
        (cache, log)
    }

    fn live_sum(cache: &BudgetedCache<&'static str, Blob>) -> u64 {
        cache
            .keys_by_recency()
            .iter()
            .map(|key| cache.get(key).map(|v| v.bytes).unwrap_or(0))
            .sum()
    }

    #[test]
    fn test_basic_put_get() {
        let cache = BudgetedCache::new(1024);
        let blob = Arc::new(Blob::new(100));

        assert!(cache.put("a", blob.clone()).is_none());
        let fetched = cache.get(&"a").expect("entry should be cached");
        assert!(Arc::ptr_eq(&fetched, &blob));
        assert_eq!(cache.current_bytes(), 100);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_miss() {
        let cache: BudgetedCache<&str, Blob> = BudgetedCache::new(1024);
        assert!(cache.get(&"missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_three_puts_evict_oldest() {
        let (cache, log) = recording_cache(1000);
        let a = Arc::new(Blob::new(400));
        cache.put("a", a.clone());
        cache.put("b", Arc::new(Blob::new(400)));
        cache.put("c", Arc::new(Blob::new(400)));

        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert!(cache.contains(&"c"));
        assert_eq!(cache.current_bytes(), 800);
        assert_eq!(a.release_count(), 1);
        assert_eq!(
            *log.lock(),
            vec![("a", Some(400), EvictionReason::Capacity)]
        );
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = BudgetedCache::new(1300);
        cache.put("a", Arc::new(Blob::new(400)));
        cache.put("b", Arc::new(Blob::new(400)));
        cache.put("c", Arc::new(Blob::new(400)));

        // Touch a: b is now the least recently used
        assert!(cache.get(&"a").is_some());
        cache.put("d", Arc::new(Blob::new(400)));

        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"c"));
        assert!(cache.contains(&"d"));
    }

    #[test]
    fn test_touched_middle_entry_survives() {
        let cache = BudgetedCache::new(1300);
        cache.put("a", Arc::new(Blob::new(400)));
        cache.put("b", Arc::new(Blob::new(400)));
        cache.put("c", Arc::new(Blob::new(400)));

        assert!(cache.get(&"b").is_some());
        cache.put("d", Arc::new(Blob::new(400)));

        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert_eq!(cache.keys_by_recency(), vec!["c", "b", "d"]);
    }

    #[test]
    fn test_eviction_overshoots_to_amortize() {
        let cache = BudgetedCache::new(1000);
        for key in ["a", "b", "c", "d", "e"] {
            cache.put(key, Arc::new(Blob::new(100)));
        }
        cache.put("f", Arc::new(Blob::new(700)));

        // projected 1200: target = 50 + 200, so three 100-byte entries go
        assert_eq!(cache.keys_by_recency(), vec!["d", "e", "f"]);
        assert_eq!(cache.current_bytes(), 900);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_put_replace_returns_previous_unreleased() {
        let (cache, log) = recording_cache(1000);
        let old = Arc::new(Blob::new(300));
        cache.put("a", old.clone());

        let previous = cache.put("a", Arc::new(Blob::new(500)));
        assert!(Arc::ptr_eq(&previous.unwrap(), &old));
        assert_eq!(old.release_count(), 0);
        assert_eq!(cache.current_bytes(), 500);
        assert_eq!(cache.len(), 1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_oversized_entry_is_kept_transiently() {
        let cache = BudgetedCache::new(1000);
        let a = Arc::new(Blob::new(300));
        cache.put("a", a.clone());
        cache.put("huge", Arc::new(Blob::new(1500)));

        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"huge"));
        assert_eq!(cache.current_bytes(), 1500);
        assert!(!cache.is_memory_available());

        // Explicit expunge corrects the overshoot
        assert_eq!(cache.expunge_stale_entries(), 1);
        assert_eq!(cache.current_bytes(), 0);
        assert!(cache.is_memory_available());
    }

    #[test]
    fn test_expunge_noop_under_budget() {
        let cache = BudgetedCache::new(1000);
        cache.put("a", Arc::new(Blob::new(999)));
        assert_eq!(cache.expunge_stale_entries(), 0);
        assert!(cache.is_memory_available());
        assert_eq!(cache.headroom(), 1);
    }

    #[test]
    fn test_evict_to_free_ignores_budget() {
        let (cache, log) = recording_cache(1000);
        let a = Arc::new(Blob::new(450));
        cache.put("a", a.clone());
        cache.put("b", Arc::new(Blob::new(451)));

        // Under budget, so an expunge pass does nothing
        assert_eq!(cache.expunge_stale_entries(), 0);
        assert_eq!(cache.evict_to_free(0), 0);

        assert_eq!(cache.evict_to_free(301), 1);
        assert_eq!(cache.keys_by_recency(), vec!["b"]);
        assert_eq!(cache.current_bytes(), 451);
        assert_eq!(a.release_count(), 1);
        assert_eq!(
            *log.lock(),
            vec![("a", Some(450), EvictionReason::Capacity)]
        );

        // Asking for more than is cached empties the cache
        assert_eq!(cache.evict_to_free(10_000), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_peek_leaves_recency_and_stats_alone() {
        let cache = BudgetedCache::new(1000);
        cache.put("a", Arc::new(Blob::new(100)));
        cache.put("b", Arc::new(Blob::new(100)));

        assert_eq!(cache.peek(&"a").map(|v| v.bytes), Some(100));
        assert!(cache.peek(&"missing").is_none());
        assert_eq!(cache.keys_by_recency(), vec!["a", "b"]);

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_remove_releases_and_notifies() {
        let (cache, log) = recording_cache(1000);
        let a = Arc::new(Blob::new(200));
        cache.put("a", a.clone());

        let removed = cache.remove(&"a").unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert_eq!(a.release_count(), 1);
        assert_eq!(cache.current_bytes(), 0);
        assert_eq!(
            *log.lock(),
            vec![("a", Some(200), EvictionReason::Removed)]
        );
    }

    #[test]
    fn test_remove_absent_still_notifies() {
        let (cache, log) = recording_cache(1000);
        assert!(cache.remove(&"ghost").is_none());
        assert_eq!(
            *log.lock(),
            vec![("ghost", None, EvictionReason::Removed)]
        );
        assert_eq!(cache.stats().removals, 0);
    }

    #[test]
    fn test_clear_releases_everything() {
        let (cache, log) = recording_cache(1000);
        let blobs: Vec<_> = (0..3).map(|_| Arc::new(Blob::new(100))).collect();
        for (key, blob) in ["a", "b", "c"].into_iter().zip(&blobs) {
            cache.put(key, blob.clone());
        }

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_bytes(), 0);
        assert!(blobs.iter().all(|b| b.release_count() == 1));
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn test_stats_and_rates() {
        let cache = BudgetedCache::new(1000);
        cache.put("a", Arc::new(Blob::new(250)));
        cache.get(&"a");
        cache.get(&"b");

        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.hit_rate(), 0.5);
        assert_eq!(stats.memory_utilization(), 0.25);
    }

    #[test]
    fn test_reentrant_listener_panics() {
        let cache: Arc<BudgetedCache<&'static str, Blob>> = Arc::new_cyclic(|weak| {
            let weak: std::sync::Weak<BudgetedCache<&'static str, Blob>> = weak.clone();
            BudgetedCache::with_listener(
                100,
                move |_key: &&'static str, _value: Option<&Arc<Blob>>, _reason: EvictionReason| {
                    if let Some(cache) = weak.upgrade() {
                        cache.contains(&"other");
                    }
                },
            )
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            cache.remove(&"a");
        }));
        assert!(result.is_err());

        // The guard is restored after unwinding
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_listener_may_use_other_cache() {
        let other: Arc<BudgetedCache<&'static str, Blob>> = Arc::new(BudgetedCache::new(100));
        let other_clone = other.clone();
        let cache = BudgetedCache::with_listener(
            100,
            move |key: &&'static str, _value: Option<&Arc<Blob>>, _reason: EvictionReason| {
                other_clone.remove(key);
            },
        );
        other.put("a", Arc::new(Blob::new(10)));
        cache.put("a", Arc::new(Blob::new(10)));
        cache.remove(&"a");
        assert!(!other.contains(&"a"));
    }

    #[test]
    fn test_budget_invariant_under_concurrency() {
        let cache: Arc<BudgetedCache<&'static str, Blob>> = Arc::new(BudgetedCache::new(5_000));
        const KEYS: [&str; 12] = [
            "k0", "k1", "k2", "k3", "k4", "k5", "k6", "k7", "k8", "k9", "k10", "k11",
        ];

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..500 {
                        let key = KEYS[rng.gen_range(0..KEYS.len())];
                        match rng.gen_range(0..4) {
                            0 => {
                                cache.remove(&key);
                            }
                            1 => {
                                cache.get(&key);
                            }
                            2 => {
                                cache.expunge_stale_entries();
                            }
                            _ => {
                                cache.put(key, Arc::new(Blob::new(rng.gen_range(1..1_500))));
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.current_bytes(), live_sum(&cache));
    }
}
