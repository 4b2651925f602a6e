//! Media Viewer Cache Library
//!
//! Byte-budgeted LRU cache for decoded image resources, with eviction
//! notification and explicit release of evicted buffers.

pub mod budget;
pub mod config;
pub mod listener;
mod lru;
pub mod resource;

pub use budget::{BudgetedCache, CacheStats};
pub use config::{CacheConfig, ConfigError};
pub use listener::{EvictionListener, EvictionReason, NoopListener};
pub use resource::{CacheKey, Resource};
