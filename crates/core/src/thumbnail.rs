//! Thumbnail tier with disk spill
//!
//! Thumbnails are small and numerous, so the tier favours responsiveness
//! over immediacy: [`ThumbnailSpillTier::request`] never blocks. A miss
//! schedules a build on the tier's own worker and returns `None`; the
//! caller is told through a completion callback when it is worth asking
//! again. A second request for a key that is already building also returns
//! `None` straight away.
//!
//! Built thumbnails are written to a [`SpillStore`] when possible, and the
//! in-memory copy is dropped. Later requests decode the spilled file on the
//! thumbnail worker and keep the result in a small [`BudgetedCache`].

use crate::coordinator::LoadCoordinator;
use crate::decoder::Decoder;
use crate::error::LoadError;
use crate::image::DecodedImage;
use crate::spill::{SpillError, SpillStore};
use dashmap::DashMap;
use media_viewer_cache::config::{MAX_THUMBNAIL_SIZE, MIN_THUMBNAIL_SIZE};
use media_viewer_cache::{BudgetedCache, CacheConfig, CacheKey, Resource};
use media_viewer_scheduler::{CancellationToken, SchedulerError, SerialWorker};
use parking_lot::Mutex;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Supplies the primary image a thumbnail is derived from.
pub trait ThumbnailSource<K>: Send + Sync {
    /// Load (or fetch from cache) the full image for `key`.
    fn source_image(&self, key: &K) -> Result<Arc<DecodedImage>, LoadError>;

    /// Called after derivation when primary images are not kept.
    fn release_source(&self, _key: &K) {}
}

impl<K, D> ThumbnailSource<K> for LoadCoordinator<K, D>
where
    K: CacheKey,
    D: Decoder<K, Output = DecodedImage>,
{
    fn source_image(&self, key: &K) -> Result<Arc<DecodedImage>, LoadError> {
        self.ensure_loaded(key)
    }

    fn release_source(&self, key: &K) {
        self.evict(key);
    }
}

/// Where the thumbnail for a key is stored.
#[derive(Debug, Clone)]
pub enum SpillRecord {
    /// Held only by the in-memory cache
    InMemory(Arc<DecodedImage>),
    /// Persisted as a file; any in-memory copy is a disposable read cache
    OnDisk(PathBuf),
}

#[derive(Debug)]
struct ThumbSlot {
    loading: AtomicBool,
    unreadable: AtomicBool,
    disposed: AtomicBool,
    /// Most recently requested edge size
    size: AtomicU32,
    /// Edge size of the stored thumbnail, 0 when none is stored
    built_size: AtomicU32,
    spill_path: Mutex<Option<PathBuf>>,
}

impl ThumbSlot {
    fn new(size: u32) -> Self {
        Self {
            loading: AtomicBool::new(false),
            unreadable: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            size: AtomicU32::new(size),
            built_size: AtomicU32::new(0),
            spill_path: Mutex::new(None),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct TierInner<K> {
    cache: BudgetedCache<K, DecodedImage>,
    slots: DashMap<K, Arc<ThumbSlot>>,
    source: Arc<dyn ThumbnailSource<K>>,
    spill: Option<SpillStore>,
    worker: SerialWorker,
    default_size: u32,
    keep_primary: bool,
}

/// Non-blocking thumbnail cache backed by an optional disk spill.
pub struct ThumbnailSpillTier<K> {
    inner: Arc<TierInner<K>>,
}

impl<K> Clone for ThumbnailSpillTier<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: CacheKey> ThumbnailSpillTier<K> {
    /// Build the tier with its own cache and worker.
    ///
    /// If spilling is enabled but the spill directory cannot be created, the
    /// tier logs a warning and keeps every thumbnail in memory.
    pub fn new(
        source: Arc<dyn ThumbnailSource<K>>,
        config: &CacheConfig,
    ) -> Result<Self, SchedulerError> {
        let spill = if config.spill_enabled {
            match SpillStore::new(&config.spill_dir, config.spill_quality) {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!(dir = %config.spill_dir.display(), %err, "thumbnail spill disabled");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(TierInner {
                cache: BudgetedCache::new(config.thumbnail_cache_size),
                slots: DashMap::new(),
                source,
                spill,
                worker: SerialWorker::new("thumbnail-build")?,
                default_size: config.thumbnail_size,
                keep_primary: config.keep_primary_images,
            }),
        })
    }

    /// Request the thumbnail for `key` at the configured size.
    ///
    /// Returns the thumbnail if it is in memory. Otherwise schedules a build
    /// (or a disk read) unless one is already running, and returns `None`.
    /// `on_ready` runs on the thumbnail worker once the scheduled job has
    /// produced a result; it is dropped without being called when a build is
    /// already in progress.
    pub fn request<F>(&self, key: &K, on_ready: F) -> Option<Arc<DecodedImage>>
    where
        F: FnOnce(&K) + Send + 'static,
    {
        self.request_sized(key, self.inner.default_size, on_ready)
    }

    /// Like [`request`](Self::request) with an explicit edge size.
    ///
    /// A size different from the one the thumbnail was built at discards the
    /// old thumbnail, including its spill file, and rebuilds. A thumbnail of
    /// another size is never returned. When the size changes while a job for
    /// the key is running, that job rebuilds at the new size before it
    /// notifies its caller.
    pub fn request_sized<F>(&self, key: &K, size: u32, on_ready: F) -> Option<Arc<DecodedImage>>
    where
        F: FnOnce(&K) + Send + 'static,
    {
        let size = size.clamp(MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE);
        let slot = self.inner.slot(key, size);
        if slot.unreadable.load(Ordering::Acquire) {
            return None;
        }

        slot.size.store(size, Ordering::Release);
        let built_size = slot.built_size.load(Ordering::Acquire);
        if built_size == size {
            if let Some(thumb) = self.inner.cache.get(key) {
                return Some(thumb);
            }
        } else if built_size != 0 && !slot.loading.load(Ordering::Acquire) {
            debug!(?key, built_size, size, "thumbnail size changed, rebuilding");
            self.inner.discard(key, &slot);
        }

        if slot
            .loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let job = {
            let inner = self.inner.clone();
            let key = key.clone();
            let slot = slot.clone();
            move |token: &CancellationToken| {
                let notify = panic::catch_unwind(AssertUnwindSafe(|| {
                    inner.build_current(&key, &slot, token)
                }))
                .unwrap_or_else(|_| {
                    error!(?key, "thumbnail build panicked");
                    false
                });
                slot.loading.store(false, Ordering::Release);
                if notify {
                    on_ready(&key);
                }
            }
        };
        if let Err(err) = self.inner.worker.submit(job) {
            warn!(?key, %err, "cannot queue thumbnail build");
            slot.loading.store(false, Ordering::Release);
        }
        None
    }

    /// The authoritative storage of the thumbnail for `key`, if built.
    pub fn record(&self, key: &K) -> Option<SpillRecord> {
        let slot = self.inner.slots.get(key).map(|slot| slot.clone())?;
        if let Some(path) = slot.spill_path.lock().clone() {
            return Some(SpillRecord::OnDisk(path));
        }
        self.inner.cache.peek(key).map(SpillRecord::InMemory)
    }

    pub fn is_building(&self, key: &K) -> bool {
        self.inner
            .slots
            .get(key)
            .is_some_and(|slot| slot.loading.load(Ordering::Acquire))
    }

    pub fn is_unreadable(&self, key: &K) -> bool {
        self.inner
            .slots
            .get(key)
            .is_some_and(|slot| slot.unreadable.load(Ordering::Acquire))
    }

    /// Drop the in-memory thumbnail and delete the spill file for `key`.
    pub fn dispose(&self, key: &K) {
        if let Some((_, slot)) = self.inner.slots.remove(key) {
            slot.disposed.store(true, Ordering::Release);
            self.inner.discard(key, &slot);
        } else {
            self.inner.cache.remove(key);
        }
    }

    /// Directory holding spilled files, if spilling is active.
    pub fn spill_dir(&self) -> Option<&Path> {
        self.inner.spill.as_ref().map(SpillStore::dir)
    }

    pub fn thumbnail_size(&self) -> u32 {
        self.inner.default_size
    }

    pub fn cache(&self) -> &BudgetedCache<K, DecodedImage> {
        &self.inner.cache
    }

    pub fn worker(&self) -> &SerialWorker {
        &self.inner.worker
    }
}

impl<K: CacheKey> TierInner<K> {
    fn slot(&self, key: &K, size: u32) -> Arc<ThumbSlot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ThumbSlot::new(size)))
            .clone()
    }

    /// Forget the built thumbnail for `key`: memory copy and spill file.
    fn discard(&self, key: &K, slot: &ThumbSlot) {
        slot.built_size.store(0, Ordering::Release);
        self.cache.remove(key);
        let path = slot.spill_path.lock().take();
        if let Some(path) = path {
            self.delete_spilled(key, &path);
        }
    }

    fn delete_spilled(&self, key: &K, path: &Path) {
        if let Some(spill) = &self.spill {
            if let Err(err) = spill.delete(path) {
                warn!(?key, path = %path.display(), %err, "failed to delete spilled thumbnail");
            }
        }
    }

    /// Job body: build at the requested size, again if the size changed
    /// meanwhile. Returns `true` when the caller should be notified.
    fn build_current(&self, key: &K, slot: &ThumbSlot, token: &CancellationToken) -> bool {
        let mut size = slot.size.load(Ordering::Acquire);
        loop {
            let notify = self.build(key, slot, size, token);
            let requested = slot.size.load(Ordering::Acquire);
            if requested == size
                || token.is_cancelled()
                || slot.is_disposed()
                || slot.unreadable.load(Ordering::Acquire)
            {
                return notify;
            }
            debug!(?key, size, requested, "thumbnail resized during build, rebuilding");
            self.discard(key, slot);
            size = requested;
        }
    }

    fn build(&self, key: &K, slot: &ThumbSlot, size: u32, token: &CancellationToken) -> bool {
        if token.is_cancelled() || slot.is_disposed() {
            return false;
        }
        if slot.built_size.load(Ordering::Acquire) != size {
            self.discard(key, slot);
        }

        let spilled = slot.spill_path.lock().clone();
        if let Some(path) = spilled {
            match self.read_spilled(&path, size) {
                Ok(thumb) => {
                    self.insert(key, thumb);
                    return true;
                }
                Err(err) => {
                    warn!(?key, path = %path.display(), %err, "spilled thumbnail unreadable, rebuilding");
                    slot.spill_path.lock().take();
                    self.delete_spilled(key, &path);
                }
            }
        }

        let primary = match self.source.source_image(key) {
            Ok(primary) => primary,
            Err(LoadError::Unreadable) => {
                slot.unreadable.store(true, Ordering::Release);
                return true;
            }
            Err(err) => {
                debug!(?key, %err, "no primary image for thumbnail");
                return false;
            }
        };
        let thumb = primary.thumbnail(size);
        drop(primary);
        if !self.keep_primary {
            self.source.release_source(key);
        }

        let Some(thumb) = thumb else {
            debug!(?key, "primary image released during thumbnail build");
            return false;
        };
        if thumb.is_degenerate() {
            warn!(?key, "degenerate thumbnail, marking unreadable");
            slot.unreadable.store(true, Ordering::Release);
            return true;
        }
        if slot.is_disposed() || slot.size.load(Ordering::Acquire) != size {
            thumb.release();
            return false;
        }

        if let Some(spill) = &self.spill {
            match spill.write(&thumb) {
                Ok(path) => {
                    thumb.release();
                    debug!(?key, path = %path.display(), "thumbnail spilled to disk");
                    *slot.spill_path.lock() = Some(path.clone());
                    slot.built_size.store(size, Ordering::Release);
                    if slot.is_disposed() {
                        slot.spill_path.lock().take();
                        self.delete_spilled(key, &path);
                        return false;
                    }
                    return true;
                }
                Err(err) => warn!(?key, %err, "thumbnail spill failed, keeping it in memory"),
            }
        }

        self.insert(key, thumb);
        slot.built_size.store(size, Ordering::Release);
        true
    }

    fn read_spilled(&self, path: &Path, size: u32) -> Result<DecodedImage, SpillError> {
        let spill = self.spill.as_ref().ok_or_else(|| {
            SpillError::Io(io::Error::new(io::ErrorKind::NotFound, "spill store is disabled"))
        })?;
        let image = spill.read(path)?;
        if image.width().max(image.height()) > size {
            image.thumbnail(size).ok_or(SpillError::Released)
        } else {
            Ok(image)
        }
    }

    fn insert(&self, key: &K, thumb: DecodedImage) {
        if let Some(previous) = self.cache.put(key.clone(), Arc::new(thumb)) {
            previous.release();
        }
    }
}

impl<K: CacheKey> std::fmt::Debug for ThumbnailSpillTier<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailSpillTier")
            .field("spill_dir", &self.spill_dir())
            .field("worker", &self.inner.worker)
            .field("tracked_keys", &self.inner.slots.len())
            .finish()
    }
}
