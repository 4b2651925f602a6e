//! Deterministic decoder used by `simulate`

use image::{Rgba, RgbaImage};
use media_viewer_core::{DecodeContext, DecodeError, DecodedImage, Decoder};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Counters reported alongside the session stats.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DecoderCounters {
    pub decodes: u64,
    pub injected_exhaustions: u64,
    pub corrupt: u64,
    pub trims: u64,
}

/// Builds gradient images of a fixed size.
///
/// Every `exhaust_every`-th key fails its first attempt with a memory
/// shortage, and every `corrupt_every`-th key never decodes. A value of 0
/// disables either injection.
#[derive(Debug, Default)]
pub struct SyntheticDecoder {
    width: u32,
    height: u32,
    exhaust_every: u64,
    corrupt_every: u64,
    decodes: AtomicU64,
    injected_exhaustions: AtomicU64,
    corrupt: AtomicU64,
    trims: AtomicU64,
}

impl SyntheticDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            ..Self::default()
        }
    }

    pub fn with_exhaust_every(mut self, every: u64) -> Self {
        self.exhaust_every = every;
        self
    }

    pub fn with_corrupt_every(mut self, every: u64) -> Self {
        self.corrupt_every = every;
        self
    }

    /// Footprint of one decoded image.
    pub fn image_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * 4
    }

    pub fn counters(&self) -> DecoderCounters {
        DecoderCounters {
            decodes: self.decodes.load(Ordering::Relaxed),
            injected_exhaustions: self.injected_exhaustions.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
        }
    }

    fn hits(every: u64, key: u64) -> bool {
        every != 0 && (key + 1) % every == 0
    }
}

impl Decoder<u64> for SyntheticDecoder {
    type Output = DecodedImage;

    fn decode(&self, key: &u64, ctx: &DecodeContext) -> Result<DecodedImage, DecodeError> {
        self.decodes.fetch_add(1, Ordering::Relaxed);

        if Self::hits(self.corrupt_every, *key) {
            self.corrupt.fetch_add(1, Ordering::Relaxed);
            return Err(DecodeError::Failed(format!("synthetic image {key} is corrupt")));
        }

        let bytes = self.image_bytes();
        if Self::hits(self.exhaust_every, *key) && !ctx.is_retry() {
            self.injected_exhaustions.fetch_add(1, Ordering::Relaxed);
            debug!(key, "injecting memory shortage");
            return Err(DecodeError::ResourceExhausted {
                requested: bytes,
                available: 0,
            });
        }
        ctx.reserve(bytes)?;

        if ctx.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }

        let seed = (*key % 256) as u8;
        let (width, height) = (self.width, self.height);
        let pixels = RgbaImage::from_fn(width, height, |x, y| {
            let r = (x * 255 / width) as u8;
            let g = (y * 255 / height) as u8;
            Rgba([r, g, seed, 255])
        });
        Ok(DecodedImage::new(pixels))
    }

    fn trim_memory(&self) {
        self.trims.fetch_add(1, Ordering::Relaxed);
    }
}
