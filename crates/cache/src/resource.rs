//! Cacheable resources and keys
//!
//! A resource is a decoded buffer whose memory lives outside the normal
//! ownership story of the cache: it is shared between the cache and every
//! thread that asked for it, and it has to be released explicitly when the
//! cache lets go of it.

use std::fmt::Debug;
use std::hash::Hash;

/// A decoded buffer with a byte footprint and an explicit release operation.
///
/// Resources are handed out as `Arc<V>` so the cache and any number of
/// readers can hold the same instance. For that reason `release` takes
/// `&self` and implementations must make it idempotent.
///
/// # Contract
///
/// * `physical_bytes` must return the same value for the whole lifetime of
///   the instance, including after release. The cache relies on it to keep
///   its byte counter exact.
/// * Once `release` has been called the buffer must not be read again.
pub trait Resource: Send + Sync {
    /// Footprint of the underlying buffer in bytes, used for budgeting.
    fn physical_bytes(&self) -> u64;

    /// Frees the underlying buffer.
    fn release(&self);
}

/// Bounds required from a cache key.
///
/// Keys are opaque, value-compared identities of the owner of a resource.
/// `Debug` is required so keys can appear in log events.
pub trait CacheKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}
