//! Decoded RGBA image resource

use image::RgbaImage;
use media_viewer_cache::Resource;
use parking_lot::RwLock;

const BYTES_PER_PIXEL: u64 = 4;

/// A decoded RGBA8 pixel buffer.
///
/// The byte footprint is fixed at construction and stays the same after
/// [`release`](Resource::release), which drops the pixels.
#[derive(Debug)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    bytes: u64,
    pixels: RwLock<Option<RgbaImage>>,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        let (width, height) = pixels.dimensions();
        Self {
            width,
            height,
            bytes: u64::from(width) * u64::from(height) * BYTES_PER_PIXEL,
            pixels: RwLock::new(Some(pixels)),
        }
    }

    /// Wrap a raw RGBA8 buffer. Returns `None` if the length does not match.
    pub fn from_raw(width: u32, height: u32, raw: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, raw).map(Self::new)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// An image with a zero dimension carries no pixels.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn is_released(&self) -> bool {
        self.pixels.read().is_none()
    }

    /// Run `f` against the pixels. Returns `None` once the image is released.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&RgbaImage) -> R) -> Option<R> {
        self.pixels.read().as_ref().map(f)
    }

    /// Aspect-preserving downscale so that neither edge exceeds `max_edge`.
    ///
    /// Images already within bounds are copied unchanged. Returns `None` once
    /// the image is released.
    pub fn thumbnail(&self, max_edge: u32) -> Option<DecodedImage> {
        let (width, height) = fit_within(self.width, self.height, max_edge);
        self.with_pixels(|pixels| {
            if (width, height) == pixels.dimensions() {
                pixels.clone()
            } else {
                image::imageops::thumbnail(pixels, width, height)
            }
        })
        .map(DecodedImage::new)
    }
}

impl Resource for DecodedImage {
    fn physical_bytes(&self) -> u64 {
        self.bytes
    }

    fn release(&self) {
        self.pixels.write().take();
    }
}

fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_edge || longest == 0 {
        return (width, height);
    }
    let scale = f64::from(max_edge) / f64::from(longest);
    let scaled = |edge: u32| ((f64::from(edge) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}
