//! Cache configuration for budgets, thumbnail spilling and recovery.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const MB: u64 = 1024 * 1024;

/// Smallest thumbnail edge in pixels.
pub const MIN_THUMBNAIL_SIZE: u32 = 48;
/// Default thumbnail edge in pixels.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 144;
/// Largest thumbnail edge in pixels.
pub const MAX_THUMBNAIL_SIZE: u32 = 256;

/// Configuration for the image caches.
///
/// Sizes are in bytes. `decode_memory_limit` is the ceiling on native memory
/// a decode may assume is available: the pre-flight admission check compares
/// a decode's estimate against `decode_memory_limit - image cache usage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of the primary (decoded image) cache
    pub image_cache_size: u64,
    /// Native memory ceiling used for decode admission
    pub decode_memory_limit: u64,
    /// Byte budget of the in-memory thumbnail cache
    pub thumbnail_cache_size: u64,
    /// Thumbnail edge in pixels
    pub thumbnail_size: u32,
    /// JPEG quality of spilled thumbnails (1-100)
    pub spill_quality: u8,
    /// Whether derived thumbnails are written to disk
    pub spill_enabled: bool,
    /// Parent directory of the process-scoped spill directory
    pub spill_dir: PathBuf,
    /// Pause after a forced eviction before the decode is retried
    pub recovery_pause_ms: u64,
    /// Keep the primary image cached after a thumbnail was derived from it
    pub keep_primary_images: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            image_cache_size: 512 * MB,
            decode_memory_limit: 1024 * MB,
            thumbnail_cache_size: 30_000_000,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            spill_quality: 80,
            spill_enabled: true,
            spill_dir: Self::default_spill_dir(),
            recovery_pause_ms: 100,
            keep_primary_images: true,
        }
    }
}

impl CacheConfig {
    /// Sets the primary cache budget in megabytes.
    ///
    /// The decode memory limit follows at twice the cache budget. Both
    /// saturate at `u64::MAX`; see [`Self::try_with_image_cache_mb`].
    pub fn with_image_cache_mb(mut self, mb: u64) -> Self {
        self.image_cache_size = mb.saturating_mul(MB);
        self.decode_memory_limit = mb.saturating_mul(2 * MB);
        self
    }

    /// Sets the primary cache budget in megabytes, rejecting sizes whose
    /// byte count (or doubled decode limit) does not fit in a `u64`.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] naming `image_cache_mb`.
    pub fn try_with_image_cache_mb(self, mb: u64) -> Result<Self, ConfigError> {
        self.set_image_cache_mb("image_cache_mb", mb)
    }

    fn set_image_cache_mb(mut self, key: &str, mb: u64) -> Result<Self, ConfigError> {
        self.image_cache_size = mb_to_bytes(key, mb)?;
        self.decode_memory_limit = mb_to_bytes(key, mb)?
            .checked_mul(2)
            .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))?;
        Ok(self)
    }

    /// Sets the primary cache budget in bytes, leaving the decode limit alone.
    pub fn with_image_cache_bytes(mut self, bytes: u64) -> Self {
        self.image_cache_size = bytes;
        self
    }

    /// Sets the decode memory limit in bytes.
    pub fn with_decode_memory_limit(mut self, bytes: u64) -> Self {
        self.decode_memory_limit = bytes;
        self
    }

    /// Sets the thumbnail cache budget in bytes.
    pub fn with_thumbnail_cache_bytes(mut self, bytes: u64) -> Self {
        self.thumbnail_cache_size = bytes;
        self
    }

    /// Sets the thumbnail edge, clamped to the supported range.
    pub fn with_thumbnail_size(mut self, size: u32) -> Self {
        self.thumbnail_size = clamp_thumbnail_size(size);
        self
    }

    /// Sets the JPEG quality of spilled thumbnails, clamped to 1-100.
    pub fn with_spill_quality(mut self, quality: u8) -> Self {
        self.spill_quality = quality.clamp(1, 100);
        self
    }

    /// Enables or disables writing thumbnails to disk.
    pub fn with_spill_enabled(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }

    /// Sets the parent directory for spilled thumbnails.
    pub fn with_spill_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.spill_dir = path.as_ref().to_path_buf();
        self
    }

    /// Sets the recovery pause in milliseconds.
    pub fn with_recovery_pause_ms(mut self, ms: u64) -> Self {
        self.recovery_pause_ms = ms;
        self
    }

    /// Sets whether primary images stay cached after thumbnail derivation.
    pub fn with_keep_primary_images(mut self, keep: bool) -> Self {
        self.keep_primary_images = keep;
        self
    }

    /// Returns the default parent directory for spilled thumbnails.
    ///
    /// - macOS: ~/Library/Caches/media-viewer/thumb
    /// - Linux: ~/.cache/media-viewer/thumb
    /// - Windows: %LOCALAPPDATA%\media-viewer\thumb
    ///
    /// Falls back to the system temp directory.
    pub fn default_spill_dir() -> PathBuf {
        match dirs::cache_dir() {
            Some(cache_dir) => cache_dir.join("media-viewer").join("thumb"),
            None => std::env::temp_dir().join("media-viewer").join("thumb"),
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `MEDIA_VIEWER_IMAGE_CACHE_MB`: primary cache size in MB (default: 512)
    /// - `MEDIA_VIEWER_DECODE_LIMIT_MB`: decode memory limit in MB (default: 2x image cache)
    /// - `MEDIA_VIEWER_THUMB_CACHE_MB`: thumbnail cache size in MB
    /// - `MEDIA_VIEWER_THUMB_SIZE`: thumbnail edge in pixels
    /// - `MEDIA_VIEWER_SPILL`: `0`/`false` disables the disk spill
    /// - `MEDIA_VIEWER_SPILL_DIR`: spill parent directory
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Applies `MEDIA_VIEWER_*` environment variables to this configuration.
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(mb) = env_number("MEDIA_VIEWER_IMAGE_CACHE_MB")? {
            self = self.set_image_cache_mb("MEDIA_VIEWER_IMAGE_CACHE_MB", mb)?;
        }
        if let Some(mb) = env_number("MEDIA_VIEWER_DECODE_LIMIT_MB")? {
            self.decode_memory_limit = mb_to_bytes("MEDIA_VIEWER_DECODE_LIMIT_MB", mb)?;
        }
        if let Some(mb) = env_number("MEDIA_VIEWER_THUMB_CACHE_MB")? {
            self.thumbnail_cache_size = mb_to_bytes("MEDIA_VIEWER_THUMB_CACHE_MB", mb)?;
        }
        if let Some(size) = env_number("MEDIA_VIEWER_THUMB_SIZE")? {
            let size = u32::try_from(size)
                .map_err(|_| ConfigError::InvalidValue("MEDIA_VIEWER_THUMB_SIZE".to_string()))?;
            self = self.with_thumbnail_size(size);
        }
        if let Ok(val) = std::env::var("MEDIA_VIEWER_SPILL") {
            self.spill_enabled = match val.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::InvalidValue("MEDIA_VIEWER_SPILL".to_string())),
            };
        }
        if let Ok(val) = std::env::var("MEDIA_VIEWER_SPILL_DIR") {
            self.spill_dir = PathBuf::from(val);
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Missing keys keep their default values. Expected file format:
    /// ```toml
    /// image_cache_size = 536870912
    /// thumbnail_size = 144
    /// spill_dir = "/path/to/spill"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.thumbnail_size = clamp_thumbnail_size(config.thumbnail_size);
        config.spill_quality = config.spill_quality.clamp(1, 100);
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Returns the primary cache size in megabytes.
    pub fn image_cache_mb(&self) -> u64 {
        self.image_cache_size / MB
    }

    /// Returns the recovery pause as a duration.
    pub fn recovery_pause(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.recovery_pause_ms)
    }
}

fn clamp_thumbnail_size(size: u32) -> u32 {
    size.clamp(MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE)
}

fn mb_to_bytes(key: &str, mb: u64) -> Result<u64, ConfigError> {
    mb.checked_mul(MB)
        .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))
}

fn env_number(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The configuration file is not valid TOML
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration could not be serialized
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
