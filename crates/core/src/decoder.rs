//! Decoder boundary
//!
//! Format-specific readers live outside this crate. They plug in through the
//! [`Decoder`] trait and report memory pressure explicitly: before allocating
//! a pixel buffer a decoder calls [`DecodeContext::reserve`] with its size
//! estimate and returns the resulting [`DecodeError::ResourceExhausted`]
//! instead of attempting an allocation that cannot be satisfied.

use media_viewer_cache::Resource;
use media_viewer_scheduler::CancellationToken;

/// Failure reported by a decoder.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Not enough memory for the decoded buffer. Retried once after eviction.
    #[error("not enough memory to decode: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: u64, available: u64 },

    /// Format or I/O failure. Terminal for the key.
    #[error("decode failed: {0}")]
    Failed(String),

    /// The decode observed its cancellation token.
    #[error("decode cancelled")]
    Cancelled,
}

/// Per-attempt information handed to [`Decoder::decode`].
#[derive(Debug, Clone)]
pub struct DecodeContext {
    headroom: u64,
    attempt: u32,
    token: CancellationToken,
}

impl DecodeContext {
    pub fn new(headroom: u64, attempt: u32, token: CancellationToken) -> Self {
        Self {
            headroom,
            attempt,
            token,
        }
    }

    /// Bytes a new buffer may occupy right now.
    pub fn headroom(&self) -> u64 {
        self.headroom
    }

    /// 1 for the first attempt, 2 for the retry after eviction.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Pre-flight admission check for a buffer of `bytes`.
    ///
    /// # Errors
    /// Returns [`DecodeError::ResourceExhausted`] when `bytes` exceeds the
    /// current headroom.
    pub fn reserve(&self, bytes: u64) -> Result<(), DecodeError> {
        if bytes > self.headroom {
            Err(DecodeError::ResourceExhausted {
                requested: bytes,
                available: self.headroom,
            })
        } else {
            Ok(())
        }
    }
}

/// Produces decoded resources for keys.
///
/// Calls are serialized: at most one `decode` runs at a time per
/// coordinator, on its dedicated worker thread.
pub trait Decoder<K>: Send + Sync + 'static {
    /// The decoded buffer type.
    type Output: Resource + 'static;

    /// Decode the media identified by `key`.
    fn decode(&self, key: &K, ctx: &DecodeContext) -> Result<Self::Output, DecodeError>;

    /// Drop caches and scratch buffers held by the decoder.
    ///
    /// Called between a failed attempt and its retry.
    fn trim_memory(&self) {}

    /// Close any reader or stream kept open for `key`.
    ///
    /// Called whenever the key's resource leaves the cache. Must not call
    /// back into the coordinator.
    fn close(&self, _key: &K) {}
}
