//! Single-flight image loading
//!
//! [`LoadCoordinator`] sits in front of a [`BudgetedCache`] and makes sure
//! that at most one decode per key is ever queued or running. Every caller
//! that misses the cache for the same key waits on the same in-flight load
//! and observes the same outcome. Decodes run on one dedicated
//! [`SerialWorker`], so only one decode runs at a time across all keys.
//!
//! Per-key state machine:
//!
//! ```text
//! Unloaded --miss--> Loading --ok--> Cached --evicted--> Unloaded
//!                       |----decode failed----> PermanentlyUnreadable
//!                       |----exhausted twice--> Unloaded
//! ```

use crate::decoder::{DecodeContext, DecodeError, Decoder};
use crate::error::{LoadError, LoadResult};
use dashmap::DashMap;
use media_viewer_cache::{
    BudgetedCache, CacheConfig, CacheKey, EvictionListener, EvictionReason, Resource,
};
use media_viewer_scheduler::{CancellationToken, SchedulerError, SerialWorker};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How often a blocked caller re-checks its own cancellation token.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Loading state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoadState {
    /// Not in the cache; the next request decodes it
    Unloaded = 0,
    /// A decode is queued or running
    Loading = 1,
    /// Present in the cache
    Cached = 2,
    /// Decoding failed; never retried until [`LoadCoordinator::reset`]
    PermanentlyUnreadable = 3,
}

impl LoadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => LoadState::Loading,
            2 => LoadState::Cached,
            3 => LoadState::PermanentlyUnreadable,
            _ => LoadState::Unloaded,
        }
    }
}

/// Book-keeping for one key. Outlives cache entries.
struct KeySlot<V> {
    state: AtomicU8,
    flight: Mutex<Option<Arc<LoadFlight<V>>>>,
    disposed: AtomicBool,
}

impl<V> KeySlot<V> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LoadState::Unloaded as u8),
            flight: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LoadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: LoadState, to: LoadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Apply a state decided by `flight`'s job, unless a newer flight has
    /// taken over the key since.
    fn settle(&self, flight: &LoadFlight<V>, state: LoadState) {
        let current = self.flight.lock();
        if is_active(&current, flight) {
            self.set_state(state);
        }
    }
}

fn is_active<V>(current: &Option<Arc<LoadFlight<V>>>, flight: &LoadFlight<V>) -> bool {
    current
        .as_ref()
        .is_some_and(|active| std::ptr::eq(Arc::as_ptr(active), flight))
}

/// One queued or running decode, shared by every caller waiting on it.
struct LoadFlight<V> {
    outcome: Mutex<Option<LoadResult<Arc<V>>>>,
    done: Condvar,
    /// Guarded by the owning slot's `flight` lock.
    waiters: AtomicUsize,
    token: CancellationToken,
}

impl<V> LoadFlight<V> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
            waiters: AtomicUsize::new(1),
            token: CancellationToken::new(),
        }
    }

    fn complete(&self, outcome: LoadResult<Arc<V>>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }
}

/// Flips the slot back to `Unloaded` and closes the decoder's reader
/// whenever an entry leaves the cache.
struct SlotListener<K, D: Decoder<K>> {
    slots: Arc<DashMap<K, Arc<KeySlot<D::Output>>>>,
    decoder: Arc<D>,
}

impl<K: CacheKey, D: Decoder<K>> EvictionListener<K, D::Output> for SlotListener<K, D> {
    fn on_evicted(&self, key: &K, _value: Option<&Arc<D::Output>>, reason: EvictionReason) {
        if let Some(slot) = self.slots.get(key) {
            slot.transition(LoadState::Cached, LoadState::Unloaded);
        }
        self.decoder.close(key);
        debug!(?key, %reason, "image left the cache");
    }
}

struct Inner<K, D: Decoder<K>> {
    cache: BudgetedCache<K, D::Output>,
    slots: Arc<DashMap<K, Arc<KeySlot<D::Output>>>>,
    decoder: Arc<D>,
    worker: SerialWorker,
    decode_memory_limit: u64,
    recovery_pause: Duration,
}

/// Single-flight loader in front of a byte-budgeted cache.
///
/// Cloning is cheap: clones share the cache, the key table and the worker.
///
/// # Example
///
/// ```
/// use media_viewer_cache::{CacheConfig, Resource};
/// use media_viewer_core::{DecodeContext, DecodeError, Decoder, LoadCoordinator};
///
/// struct Buffer(u64);
///
/// impl Resource for Buffer {
///     fn physical_bytes(&self) -> u64 {
///         self.0
///     }
///     fn release(&self) {}
/// }
///
/// struct FixedSize;
///
/// impl Decoder<u32> for FixedSize {
///     type Output = Buffer;
///
///     fn decode(&self, _key: &u32, ctx: &DecodeContext) -> Result<Buffer, DecodeError> {
///         ctx.reserve(1024)?;
///         Ok(Buffer(1024))
///     }
/// }
///
/// let images: LoadCoordinator<u32, FixedSize> =
///     LoadCoordinator::new(FixedSize, &CacheConfig::default()).unwrap();
/// let first = images.ensure_loaded(&7).unwrap();
/// let again = images.ensure_loaded(&7).unwrap();
/// assert!(std::sync::Arc::ptr_eq(&first, &again));
/// assert!(images.is_cached(&7));
/// ```
pub struct LoadCoordinator<K, D: Decoder<K>> {
    inner: Arc<Inner<K, D>>,
}

impl<K, D: Decoder<K>> Clone for LoadCoordinator<K, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: CacheKey, D: Decoder<K>> LoadCoordinator<K, D> {
    /// Build a coordinator with its own cache and decode worker.
    ///
    /// Uses `image_cache_size`, `decode_memory_limit` and `recovery_pause_ms`
    /// from `config`.
    pub fn new(decoder: D, config: &CacheConfig) -> Result<Self, SchedulerError> {
        let slots = Arc::new(DashMap::new());
        let decoder = Arc::new(decoder);
        let listener = SlotListener {
            slots: slots.clone(),
            decoder: decoder.clone(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                cache: BudgetedCache::with_listener(config.image_cache_size, listener),
                slots,
                decoder,
                worker: SerialWorker::new("image-decode")?,
                decode_memory_limit: config.decode_memory_limit,
                recovery_pause: config.recovery_pause(),
            }),
        })
    }

    /// Return the resource for `key`, decoding it if needed.
    ///
    /// Blocks until the key's load completes. Concurrent callers for the same
    /// key share one decode.
    pub fn ensure_loaded(&self, key: &K) -> LoadResult<Arc<D::Output>> {
        self.ensure_loaded_with(key, &CancellationToken::new())
    }

    /// Like [`ensure_loaded`](Self::ensure_loaded), but stops waiting with
    /// [`LoadError::Cancelled`] once `waiter` is cancelled.
    ///
    /// Cancelling one waiter never affects the others. The decode itself is
    /// cancelled only when its last waiter gives up.
    pub fn ensure_loaded_with(
        &self,
        key: &K,
        waiter: &CancellationToken,
    ) -> LoadResult<Arc<D::Output>> {
        loop {
            if let Some(value) = self.inner.cache.get(key) {
                return Ok(value);
            }
            let slot = self.inner.slot(key);
            if slot.state() == LoadState::PermanentlyUnreadable {
                return Err(LoadError::Unreadable);
            }
            if waiter.is_cancelled() {
                return Err(LoadError::Cancelled);
            }

            let flight = self.join_or_start(key, &slot)?;
            match self.wait(&slot, &flight, waiter) {
                // Abandoned by its other waiters; start over with a fresh load
                Err(LoadError::Cancelled) if !waiter.is_cancelled() && !slot.is_disposed() => {
                    continue
                }
                outcome => return outcome,
            }
        }
    }

    /// Return the resource for `key`, or `None` for any failure.
    pub fn image(&self, key: &K) -> Option<Arc<D::Output>> {
        self.ensure_loaded(key).ok()
    }

    /// Check if `key` is in the cache, without loading or promoting it.
    pub fn is_cached(&self, key: &K) -> bool {
        self.inner.cache.contains(key)
    }

    pub fn state(&self, key: &K) -> LoadState {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.state())
            .unwrap_or(LoadState::Unloaded)
    }

    /// Forget `key` entirely: cancel its load, drop its state and remove it
    /// from the cache.
    pub fn dispose(&self, key: &K) {
        if let Some((_, slot)) = self.inner.slots.remove(key) {
            slot.disposed.store(true, Ordering::Release);
            if let Some(flight) = slot.flight.lock().as_ref() {
                flight.token.cancel();
            }
        }
        self.inner.cache.remove(key);
    }

    /// Remove `key` from the cache but keep its state, so a later request
    /// reloads it.
    ///
    /// The decoder's reader for `key` is closed even when nothing was cached.
    pub fn evict(&self, key: &K) {
        self.inner.cache.remove(key);
    }

    /// Clear a permanent failure so the key is decoded again on next request.
    ///
    /// Returns `true` if the key was marked unreadable.
    pub fn reset(&self, key: &K) -> bool {
        self.inner.slots.get(key).is_some_and(|slot| {
            slot.transition(LoadState::PermanentlyUnreadable, LoadState::Unloaded)
        })
    }

    pub fn cached_count(&self) -> usize {
        self.inner.cache.len()
    }

    /// Number of keys with tracked state.
    pub fn tracked_keys(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn cache(&self) -> &BudgetedCache<K, D::Output> {
        &self.inner.cache
    }

    pub fn worker(&self) -> &SerialWorker {
        &self.inner.worker
    }

    pub fn decoder(&self) -> &D {
        &self.inner.decoder
    }

    fn join_or_start(
        &self,
        key: &K,
        slot: &Arc<KeySlot<D::Output>>,
    ) -> LoadResult<Arc<LoadFlight<D::Output>>> {
        let mut current = slot.flight.lock();
        if let Some(flight) = current.as_ref() {
            if !flight.token.is_cancelled() {
                flight.waiters.fetch_add(1, Ordering::AcqRel);
                return Ok(flight.clone());
            }
        }

        let flight = Arc::new(LoadFlight::new());
        slot.set_state(LoadState::Loading);

        let job = {
            let inner = self.inner.clone();
            let key = key.clone();
            let slot = slot.clone();
            let flight = flight.clone();
            move |_: &CancellationToken| inner.run_flight(&key, &slot, &flight)
        };
        match self.inner.worker.submit(job) {
            Ok(_) => {
                debug!(?key, "decode queued");
                *current = Some(flight.clone());
                Ok(flight)
            }
            Err(err) => {
                warn!(?key, %err, "cannot queue decode");
                slot.set_state(LoadState::Unloaded);
                Err(LoadError::WorkerUnavailable)
            }
        }
    }

    fn wait(
        &self,
        slot: &KeySlot<D::Output>,
        flight: &LoadFlight<D::Output>,
        waiter: &CancellationToken,
    ) -> LoadResult<Arc<D::Output>> {
        let mut outcome = flight.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                let result = result.clone();
                drop(outcome);
                self.leave(slot, flight, false);
                return result;
            }
            if waiter.is_cancelled() {
                drop(outcome);
                self.leave(slot, flight, true);
                return Err(LoadError::Cancelled);
            }
            flight.done.wait_for(&mut outcome, WAIT_POLL_INTERVAL);
        }
    }

    fn leave(&self, slot: &KeySlot<D::Output>, flight: &LoadFlight<D::Output>, cancelled: bool) {
        let _guard = slot.flight.lock();
        let remaining = flight.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if cancelled && remaining == 0 && flight.outcome.lock().is_none() {
            debug!("last waiter gone, cancelling decode");
            flight.token.cancel();
        }
    }
}

impl<K: CacheKey, D: Decoder<K>> Inner<K, D> {
    fn slot(&self, key: &K) -> Arc<KeySlot<D::Output>> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeySlot::new()))
            .clone()
    }

    fn decode_headroom(&self) -> u64 {
        self.decode_memory_limit
            .saturating_sub(self.cache.current_bytes())
    }

    /// Job body: load, then publish the outcome to every waiter.
    fn run_flight(&self, key: &K, slot: &KeySlot<D::Output>, flight: &LoadFlight<D::Output>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.load(key, slot, flight)))
            .unwrap_or_else(|_| {
                error!(?key, "decoder panicked, marking media unreadable");
                slot.settle(flight, LoadState::PermanentlyUnreadable);
                Err(LoadError::Unreadable)
            });

        {
            let mut current = slot.flight.lock();
            if is_active(&current, flight) {
                *current = None;
            }
        }
        flight.complete(outcome);
    }

    fn load(
        &self,
        key: &K,
        slot: &KeySlot<D::Output>,
        flight: &LoadFlight<D::Output>,
    ) -> LoadResult<Arc<D::Output>> {
        if let Some(value) = self.cache.get(key) {
            slot.settle(flight, LoadState::Cached);
            return Ok(value);
        }
        if flight.token.is_cancelled() || slot.is_disposed() {
            slot.settle(flight, LoadState::Unloaded);
            return Err(LoadError::Cancelled);
        }

        let decoded = self.decode_with_recovery(key, slot, flight)?;

        if decoded.physical_bytes() == 0 {
            error!(?key, "decoder produced an empty buffer, marking media unreadable");
            decoded.release();
            slot.settle(flight, LoadState::PermanentlyUnreadable);
            return Err(LoadError::Unreadable);
        }
        if flight.token.is_cancelled() || slot.is_disposed() {
            debug!(?key, "decode finished after cancellation, discarding");
            decoded.release();
            slot.settle(flight, LoadState::Unloaded);
            return Err(LoadError::Cancelled);
        }

        let value = Arc::new(decoded);
        let bytes = value.physical_bytes();
        slot.settle(flight, LoadState::Cached);
        if let Some(previous) = self.cache.put(key.clone(), value.clone()) {
            previous.release();
        }
        if slot.is_disposed() {
            self.cache.remove(key);
            return Err(LoadError::Cancelled);
        }
        debug!(?key, bytes, cache_bytes = self.cache.current_bytes(), "image cached");
        Ok(value)
    }

    fn decode_with_recovery(
        &self,
        key: &K,
        slot: &KeySlot<D::Output>,
        flight: &LoadFlight<D::Output>,
    ) -> LoadResult<D::Output> {
        let mut attempt = 1;
        loop {
            let ctx = DecodeContext::new(self.decode_headroom(), attempt, flight.token.clone());
            match self.decoder.decode(key, &ctx) {
                Ok(decoded) => return Ok(decoded),
                Err(DecodeError::ResourceExhausted {
                    requested,
                    available,
                }) if attempt == 1 => {
                    warn!(?key, requested, available, "decode out of memory, evicting and retrying");
                    let shortfall = requested.saturating_sub(self.decode_headroom());
                    let evicted =
                        self.cache.expunge_stale_entries() + self.cache.evict_to_free(shortfall);
                    self.decoder.trim_memory();
                    thread::sleep(self.recovery_pause);
                    debug!(?key, evicted, "recovery pass finished");
                    attempt += 1;
                }
                Err(DecodeError::ResourceExhausted {
                    requested,
                    available,
                }) => {
                    warn!(?key, requested, available, "decode out of memory after retry");
                    slot.settle(flight, LoadState::Unloaded);
                    return Err(LoadError::ResourceExhausted {
                        requested,
                        available,
                    });
                }
                Err(DecodeError::Failed(reason)) => {
                    error!(?key, %reason, "decode failed, marking media unreadable");
                    slot.settle(flight, LoadState::PermanentlyUnreadable);
                    return Err(LoadError::Unreadable);
                }
                Err(DecodeError::Cancelled) => {
                    debug!(?key, "decode cancelled");
                    slot.settle(flight, LoadState::Unloaded);
                    return Err(LoadError::Cancelled);
                }
            }
        }
    }
}

impl<K: CacheKey, D: Decoder<K>> std::fmt::Debug for LoadCoordinator<K, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("worker", &self.inner.worker)
            .field("tracked_keys", &self.inner.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug)]
    struct Blob {
        bytes: u64,
        released: AtomicBool,
    }

    impl Resource for Blob {
        fn physical_bytes(&self) -> u64 {
            self.bytes
        }
        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedDecoder {
        calls: Mutex<HashMap<u32, u32>>,
        closed: AtomicU32,
        trims: AtomicU32,
        script: Mutex<HashMap<u32, Vec<Result<u64, DecodeError>>>>,
    }

    impl ScriptedDecoder {
        fn script(self, key: u32, steps: Vec<Result<u64, DecodeError>>) -> Self {
            self.script.lock().insert(key, steps);
            self
        }

        fn calls(&self, key: u32) -> u32 {
            self.calls.lock().get(&key).copied().unwrap_or(0)
        }
    }

    impl Decoder<u32> for ScriptedDecoder {
        type Output = Blob;

        fn decode(&self, key: &u32, _ctx: &DecodeContext) -> Result<Blob, DecodeError> {
            *self.calls.lock().entry(*key).or_insert(0) += 1;
            let step = self
                .script
                .lock()
                .get_mut(key)
                .filter(|steps| !steps.is_empty())
                .map(|steps| steps.remove(0))
                .unwrap_or(Ok(100));
            step.map(|bytes| Blob {
                bytes,
                released: AtomicBool::new(false),
            })
        }

        fn trim_memory(&self) {
            self.trims.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self, _key: &u32) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Admits each decode through `reserve`, sized by the key.
    #[derive(Default)]
    struct ReservingDecoder {
        calls: AtomicU32,
    }

    impl Decoder<u32> for ReservingDecoder {
        type Output = Blob;

        fn decode(&self, key: &u32, ctx: &DecodeContext) -> Result<Blob, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bytes = u64::from(*key);
            ctx.reserve(bytes)?;
            Ok(Blob {
                bytes,
                released: AtomicBool::new(false),
            })
        }
    }

    fn tight_config() -> CacheConfig {
        CacheConfig::default()
            .with_image_cache_bytes(1000)
            .with_decode_memory_limit(1000)
            .with_recovery_pause_ms(1)
    }

    fn config(budget: u64) -> CacheConfig {
        CacheConfig::default()
            .with_image_cache_bytes(budget)
            .with_decode_memory_limit(budget * 2)
            .with_recovery_pause_ms(1)
    }

    fn exhausted() -> Result<u64, DecodeError> {
        Err(DecodeError::ResourceExhausted {
            requested: 500,
            available: 10,
        })
    }

    #[test]
    fn test_load_then_hit() {
        let coordinator = LoadCoordinator::new(ScriptedDecoder::default(), &config(1000)).unwrap();
        assert_eq!(coordinator.state(&1), LoadState::Unloaded);

        let first = coordinator.ensure_loaded(&1).unwrap();
        let second = coordinator.ensure_loaded(&1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(coordinator.decoder().calls(1), 1);
        assert_eq!(coordinator.state(&1), LoadState::Cached);
        assert!(coordinator.is_cached(&1));
    }

    #[test]
    fn test_exhaustion_retried_once() {
        let decoder = ScriptedDecoder::default().script(1, vec![exhausted(), Ok(100)]);
        let coordinator = LoadCoordinator::new(decoder, &config(1000)).unwrap();

        assert!(coordinator.ensure_loaded(&1).is_ok());
        assert_eq!(coordinator.decoder().calls(1), 2);
        assert_eq!(coordinator.decoder().trims.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_cached(&1));
    }

    #[test]
    fn test_double_exhaustion_leaves_key_unloaded() {
        let decoder = ScriptedDecoder::default().script(1, vec![exhausted(), exhausted()]);
        let coordinator = LoadCoordinator::new(decoder, &config(1000)).unwrap();

        assert_eq!(
            coordinator.ensure_loaded(&1).err(),
            Some(LoadError::ResourceExhausted {
                requested: 500,
                available: 10
            })
        );
        assert_eq!(coordinator.state(&1), LoadState::Unloaded);
        assert!(!coordinator.is_cached(&1));

        // Retryable on a later call
        assert!(coordinator.ensure_loaded(&1).is_ok());
        assert_eq!(coordinator.decoder().calls(1), 3);
    }

    #[test]
    fn test_recovery_evicts_enough_for_the_retry() {
        let coordinator = LoadCoordinator::new(ReservingDecoder::default(), &tight_config()).unwrap();
        let oldest = coordinator.ensure_loaded(&450).unwrap();
        coordinator.ensure_loaded(&451).unwrap();
        assert_eq!(coordinator.cache().current_bytes(), 901);

        // 99 bytes of headroom: the first attempt fails, recovery frees 450
        let image = coordinator.ensure_loaded(&400).unwrap();
        assert_eq!(image.bytes, 400);
        assert_eq!(coordinator.decoder().calls.load(Ordering::SeqCst), 4);

        assert!(!coordinator.is_cached(&450));
        assert!(oldest.released.load(Ordering::SeqCst));
        assert_eq!(coordinator.state(&450), LoadState::Unloaded);
        assert!(coordinator.is_cached(&451));
        assert!(coordinator.is_cached(&400));
        assert_eq!(coordinator.cache().current_bytes(), 851);
    }

    #[test]
    fn test_recovery_cannot_exceed_decode_limit() {
        let coordinator = LoadCoordinator::new(ReservingDecoder::default(), &tight_config()).unwrap();
        coordinator.ensure_loaded(&300).unwrap();

        assert_eq!(
            coordinator.ensure_loaded(&1500).err(),
            Some(LoadError::ResourceExhausted {
                requested: 1500,
                available: 1000
            })
        );
        // Everything was evicted trying to make room
        assert_eq!(coordinator.cached_count(), 0);
        assert_eq!(coordinator.state(&1500), LoadState::Unloaded);
        assert_eq!(coordinator.state(&300), LoadState::Unloaded);
    }

    #[test]
    fn test_failure_is_permanent_until_reset() {
        let decoder =
            ScriptedDecoder::default().script(1, vec![Err(DecodeError::Failed("bad header".into()))]);
        let coordinator = LoadCoordinator::new(decoder, &config(1000)).unwrap();

        assert_eq!(
            coordinator.ensure_loaded(&1).err(),
            Some(LoadError::Unreadable)
        );
        assert_eq!(
            coordinator.ensure_loaded(&1).err(),
            Some(LoadError::Unreadable)
        );
        assert!(coordinator.image(&1).is_none());
        assert_eq!(coordinator.decoder().calls(1), 1);
        assert_eq!(coordinator.state(&1), LoadState::PermanentlyUnreadable);

        assert!(coordinator.reset(&1));
        assert!(!coordinator.reset(&1));
        assert!(coordinator.ensure_loaded(&1).is_ok());
        assert_eq!(coordinator.decoder().calls(1), 2);
    }

    #[test]
    fn test_zero_byte_decode_is_unreadable() {
        let decoder = ScriptedDecoder::default().script(1, vec![Ok(0)]);
        let coordinator = LoadCoordinator::new(decoder, &config(1000)).unwrap();

        assert_eq!(
            coordinator.ensure_loaded(&1).err(),
            Some(LoadError::Unreadable)
        );
        assert_eq!(coordinator.state(&1), LoadState::PermanentlyUnreadable);
        assert_eq!(coordinator.cached_count(), 0);
    }

    #[test]
    fn test_eviction_flips_state_and_closes_reader() {
        let decoder = ScriptedDecoder::default()
            .script(1, vec![Ok(400)])
            .script(2, vec![Ok(400)])
            .script(3, vec![Ok(400)]);
        let coordinator = LoadCoordinator::new(decoder, &config(1000)).unwrap();

        let first = coordinator.ensure_loaded(&1).unwrap();
        coordinator.ensure_loaded(&2).unwrap();
        coordinator.ensure_loaded(&3).unwrap();

        assert!(!coordinator.is_cached(&1));
        assert!(first.released.load(Ordering::SeqCst));
        assert_eq!(coordinator.state(&1), LoadState::Unloaded);
        assert_eq!(coordinator.state(&3), LoadState::Cached);
        assert_eq!(coordinator.decoder().closed.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.cache().current_bytes(), 800);
    }

    #[test]
    fn test_evict_keeps_state_and_reloads() {
        let coordinator = LoadCoordinator::new(ScriptedDecoder::default(), &config(1000)).unwrap();
        coordinator.ensure_loaded(&5).unwrap();

        coordinator.evict(&5);
        assert_eq!(coordinator.state(&5), LoadState::Unloaded);
        assert_eq!(coordinator.tracked_keys(), 1);

        coordinator.ensure_loaded(&5).unwrap();
        assert_eq!(coordinator.decoder().calls(5), 2);
    }

    #[test]
    fn test_evict_absent_key_only_closes_reader() {
        let coordinator = LoadCoordinator::new(ScriptedDecoder::default(), &config(1000)).unwrap();
        coordinator.evict(&6);

        assert_eq!(coordinator.decoder().closed.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.cache().stats().removals, 0);
        assert_eq!(coordinator.tracked_keys(), 0);
    }

    #[test]
    fn test_dispose_forgets_key() {
        let coordinator = LoadCoordinator::new(ScriptedDecoder::default(), &config(1000)).unwrap();
        let image = coordinator.ensure_loaded(&9).unwrap();

        coordinator.dispose(&9);
        assert!(image.released.load(Ordering::SeqCst));
        assert!(!coordinator.is_cached(&9));
        assert_eq!(coordinator.tracked_keys(), 0);
        assert_eq!(coordinator.state(&9), LoadState::Unloaded);
    }

    #[test]
    fn test_cancelled_waiter_returns_immediately() {
        let coordinator = LoadCoordinator::new(ScriptedDecoder::default(), &config(1000)).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(
            coordinator.ensure_loaded_with(&1, &token).err(),
            Some(LoadError::Cancelled)
        );
        assert_eq!(coordinator.decoder().calls(1), 0);
    }

    #[test]
    fn test_worker_shutdown_surfaces_error() {
        let coordinator = LoadCoordinator::new(ScriptedDecoder::default(), &config(1000)).unwrap();
        coordinator.worker().shutdown();

        assert_eq!(
            coordinator.ensure_loaded(&1).err(),
            Some(LoadError::WorkerUnavailable)
        );
        assert_eq!(coordinator.state(&1), LoadState::Unloaded);
    }
}
