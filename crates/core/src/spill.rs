//! On-disk spill store for derived thumbnails
//!
//! Thumbnails are written as JPEG files into a temporary directory that
//! lives as long as the store. Dropping the store deletes the directory and
//! everything in it.

use crate::image::DecodedImage;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Errors from writing or reading spilled thumbnails.
#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    #[error("spill I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("spill codec error: {0}")]
    Codec(#[from] image::ImageError),

    /// The image has a zero dimension and cannot be encoded
    #[error("cannot spill a degenerate image")]
    Degenerate,

    /// The image was released before it could be written
    #[error("cannot spill a released image")]
    Released,
}

/// Process-scoped directory of spilled thumbnails.
#[derive(Debug)]
pub struct SpillStore {
    dir: TempDir,
    quality: u8,
}

impl SpillStore {
    /// Create a fresh spill directory under `parent`, creating `parent` if needed.
    pub fn new(parent: &Path, quality: u8) -> Result<Self, SpillError> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix("session-").tempdir_in(parent)?;
        debug!(dir = %dir.path().display(), quality, "spill directory created");
        Ok(Self {
            dir,
            quality: quality.clamp(1, 100),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Encode `image` as JPEG into a new file and return its path.
    pub fn write(&self, image: &DecodedImage) -> Result<PathBuf, SpillError> {
        if image.is_degenerate() {
            return Err(SpillError::Degenerate);
        }
        let rgb = image
            .with_pixels(|pixels| DynamicImage::ImageRgba8(pixels.clone()).to_rgb8())
            .ok_or(SpillError::Released)?;

        let mut file = tempfile::Builder::new()
            .prefix("thumb_")
            .suffix(".jpg")
            .tempfile_in(self.dir.path())?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            JpegEncoder::new_with_quality(&mut writer, self.quality).encode_image(&rgb)?;
            writer.flush()?;
        }
        let (_, path) = file.keep().map_err(|err| SpillError::Io(err.error))?;
        Ok(path)
    }

    /// Decode a spilled file back into an RGBA image.
    pub fn read(&self, path: &Path) -> Result<DecodedImage, SpillError> {
        let pixels = image::open(path)?.to_rgba8();
        Ok(DecodedImage::new(pixels))
    }

    /// Delete a spilled file. A file that is already gone is not an error.
    pub fn delete(&self, path: &Path) -> Result<(), SpillError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
