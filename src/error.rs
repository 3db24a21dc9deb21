//! Error types for the `keysnap` crate.
//!
//! This module defines [`KeysnapError`], the unified error type returned by
//! all fallible operations in the crate. The driving loop classifies errors
//! into three kinds: cancellation (aborts the drive immediately), lifecycle
//! (operating on released resources), and everything else (transient decode
//! failures, recovered via the direct fallback extraction path).

use std::io::Error as IoError;

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// The unified error type for all `keysnap` operations.
///
/// Every public method that can fail returns `Result<T, KeysnapError>`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeysnapError {
    /// The media source could not be opened.
    #[error("Failed to open source at {path}: {reason}")]
    SourceOpen {
        /// Path that was passed to the source constructor.
        path: String,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The source does not contain a video stream.
    #[error("No video stream found in source")]
    NoVideoStream,

    /// A pipeline cycle failed to decode or render a frame.
    ///
    /// Treated as transient by the driving loop: the current request is
    /// served through the fallback extractor and the drive continues.
    #[error("Failed to decode video frame: {0}")]
    Decode(String),

    /// An operation other than release was attempted on a released segment.
    ///
    /// A lifecycle violation, surfaced to the caller rather than recovered
    /// through fallback extraction.
    #[error("Segment for source {id} has been released")]
    SegmentReleased {
        /// Identity of the source whose segment was released.
        id: String,
    },

    /// The drive was cancelled via a [`CancellationToken`](crate::CancellationToken).
    ///
    /// Propagated immediately; pipeline resources stay owned by the segment
    /// layer until an explicit [`cleanup`](crate::ThumbnailEngine::cleanup).
    #[error("Operation cancelled")]
    Cancelled,

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    /// An I/O error occurred while reading the source.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// An error from the `image` crate during frame conversion.
    #[error("Image processing error: {0}")]
    Image(#[from] ImageError),
}

impl KeysnapError {
    /// Whether this error must abort the driving loop instead of being
    /// recovered through fallback extraction.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeysnapError::Cancelled | KeysnapError::SegmentReleased { .. }
        )
    }
}

impl From<FfmpegError> for KeysnapError {
    fn from(error: FfmpegError) -> Self {
        KeysnapError::Ffmpeg(error.to_string())
    }
}
