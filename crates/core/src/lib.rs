//! Media Viewer Core Library
//!
//! Loading layer between the presentation code and format decoders:
//! single-flight image loading with memory recovery in front of a
//! byte-budgeted cache, and a non-blocking thumbnail tier that spills to
//! disk.

pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod image;
pub mod session;
pub mod spill;
pub mod thumbnail;

pub use coordinator::{LoadCoordinator, LoadState};
pub use decoder::{DecodeContext, DecodeError, Decoder};
pub use error::{LoadError, LoadResult, SessionError};
pub use self::image::DecodedImage;
pub use session::{MediaSession, SessionStats};
pub use spill::{SpillError, SpillStore};
pub use thumbnail::{SpillRecord, ThumbnailSource, ThumbnailSpillTier};
