//! Media Viewer Scheduler Library
//!
//! Serialized background workers with cooperative cancellation.
//!
//! Expensive work (image decodes, thumbnail builds) runs on dedicated
//! single-thread workers so at most one job per worker is in flight at any
//! time. Jobs observe a [`CancellationToken`] and are expected to finish
//! early once it is cancelled.
//!
//! # Example
//!
//! ```
//! use media_viewer_scheduler::SerialWorker;
//!
//! let worker = SerialWorker::new("thumbnail-worker").unwrap();
//! let handle = worker
//!     .submit(|token| if token.is_cancelled() { None } else { Some(128u32) })
//!     .unwrap();
//!
//! assert_eq!(handle.wait(), Some(Some(128)));
//! ```

mod cancel;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use worker::{JobHandle, JobId, SchedulerError, SerialWorker};
