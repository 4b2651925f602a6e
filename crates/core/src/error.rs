//! Error types surfaced by the loading layer

use media_viewer_scheduler::SchedulerError;

/// Why `ensure_loaded` produced no resource.
///
/// All variants are per-call: none of them is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The caller stopped waiting, or the load was abandoned
    #[error("load cancelled")]
    Cancelled,

    /// The media cannot be decoded; the key is not retried automatically
    #[error("media is permanently unreadable")]
    Unreadable,

    /// Both decode attempts ran out of memory
    #[error("decode needs {requested} bytes but only {available} are available")]
    ResourceExhausted { requested: u64, available: u64 },

    /// The decode worker is shut down
    #[error("decode worker is unavailable")]
    WorkerUnavailable,
}

/// Result type for load operations
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors from assembling a [`MediaSession`](crate::MediaSession).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A background worker could not be started
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_display() {
        let err = LoadError::ResourceExhausted {
            requested: 4096,
            available: 1024,
        };
        assert_eq!(
            err.to_string(),
            "decode needs 4096 bytes but only 1024 are available"
        );
        assert_eq!(LoadError::Unreadable.to_string(), "media is permanently unreadable");
    }
}
