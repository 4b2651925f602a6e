//! Session context owning the image and thumbnail caches

use crate::coordinator::LoadCoordinator;
use crate::decoder::Decoder;
use crate::error::SessionError;
use crate::image::DecodedImage;
use crate::thumbnail::ThumbnailSpillTier;
use media_viewer_cache::{CacheConfig, CacheKey, CacheStats};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Snapshot of a session's caches and workers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub images: CacheStats,
    pub thumbnails: CacheStats,
    pub tracked_images: usize,
    pub decode_jobs: u64,
    pub thumbnail_jobs: u64,
}

/// Explicitly constructed owner of one primary image cache and one
/// thumbnail tier, both sized from the same [`CacheConfig`].
pub struct MediaSession<K: CacheKey, D: Decoder<K, Output = DecodedImage>> {
    config: CacheConfig,
    images: LoadCoordinator<K, D>,
    thumbnails: ThumbnailSpillTier<K>,
}

impl<K: CacheKey, D: Decoder<K, Output = DecodedImage>> MediaSession<K, D> {
    pub fn new(decoder: D, config: CacheConfig) -> Result<Self, SessionError> {
        let images = LoadCoordinator::new(decoder, &config)?;
        let thumbnails = ThumbnailSpillTier::new(Arc::new(images.clone()), &config)?;
        info!(
            image_cache_mb = config.image_cache_mb(),
            thumbnail_cache_bytes = config.thumbnail_cache_size,
            spill_dir = ?thumbnails.spill_dir(),
            "media session started"
        );

        Ok(Self {
            config,
            images,
            thumbnails,
        })
    }

    pub fn images(&self) -> &LoadCoordinator<K, D> {
        &self.images
    }

    pub fn thumbnails(&self) -> &ThumbnailSpillTier<K> {
        &self.thumbnails
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Release everything held for `key`: thumbnail, spill file and image.
    pub fn dispose(&self, key: &K) {
        self.thumbnails.dispose(key);
        self.images.dispose(key);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            images: self.images.cache().stats(),
            thumbnails: self.thumbnails.cache().stats(),
            tracked_images: self.images.tracked_keys(),
            decode_jobs: self.images.worker().jobs_executed(),
            thumbnail_jobs: self.thumbnails.worker().jobs_executed(),
        }
    }
}
