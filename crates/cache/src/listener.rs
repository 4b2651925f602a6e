use std::fmt;
use std::sync::Arc;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Evicted by a budget-driven expunge pass.
    Capacity,
    /// Removed explicitly, typically because its owner was disposed.
    Removed,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "evicted due to memory budget"),
            EvictionReason::Removed => write!(f, "removed by owner"),
        }
    }
}

/// Hook invoked synchronously whenever an entry leaves a [`BudgetedCache`].
///
/// The hook runs inside the cache's critical section, before the cache
/// releases the resource. It is meant for book-keeping on the owner side
/// (clearing an "is cached" flag, closing a reader).
///
/// # Constraints
///
/// * It must not call back into the cache that invoked it. Doing so panics.
/// * It must not release the resource; the cache does that right after the
///   hook returns.
///
/// On explicit removal the hook fires even when the key was absent, with
/// `value == None`, so owners can clear their state unconditionally.
///
/// [`BudgetedCache`]: crate::BudgetedCache
pub trait EvictionListener<K, V>: Send + Sync {
    fn on_evicted(&self, key: &K, value: Option<&Arc<V>>, reason: EvictionReason);
}

impl<K, V, F> EvictionListener<K, V> for F
where
    F: Fn(&K, Option<&Arc<V>>, EvictionReason) + Send + Sync,
{
    fn on_evicted(&self, key: &K, value: Option<&Arc<V>>, reason: EvictionReason) {
        self(key, value, reason)
    }
}

/// Listener that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl<K, V> EvictionListener<K, V> for NoopListener {
    fn on_evicted(&self, _key: &K, _value: Option<&Arc<V>>, _reason: EvictionReason) {}
}
