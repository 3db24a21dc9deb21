//! Thumbnail requests and the produced [`Thumbnail`] value.
//!
//! A request names a source (by path and stable id), a tolerance in
//! microseconds, and a [`locate`](ThumbnailRequest::locate) operation that
//! expands it into concrete target timestamps once the source duration is
//! known. [`SingleRequest`] asks for one position; [`SpreadRequest`] asks for
//! evenly spaced positions across the whole duration (timeline scrubbers).

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use image::DynamicImage;

/// A thumbnail request collaborator.
///
/// Implementations must be cheap to share: the engine keeps one
/// `Arc<dyn ThumbnailRequest>` per in-flight position and hands it back on
/// the produced [`Thumbnail`].
pub trait ThumbnailRequest: Send + Sync {
    /// Path of the source this request targets.
    fn source_path(&self) -> &str;

    /// Stable identity of the source this request targets.
    fn source_id(&self) -> &str;

    /// Maximum acceptable distance between the requested and the produced
    /// timestamp, in microseconds.
    fn threshold_us(&self) -> i64;

    /// Expand this request into an ordered sequence of target timestamps,
    /// given the source duration in microseconds.
    fn locate(&self, duration_us: i64) -> Vec<i64>;
}

/// A request for a single thumbnail at a fixed position.
///
/// # Example
///
/// ```
/// use keysnap::{SingleRequest, ThumbnailRequest};
///
/// let request = SingleRequest::new("clips/a.mp4", "a", 2_000_000)
///     .with_threshold_us(500_000);
/// assert_eq!(request.locate(10_000_000), vec![2_000_000]);
/// // Positions past the end snap to the duration.
/// assert_eq!(request.locate(1_000_000), vec![1_000_000]);
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct SingleRequest {
    source_path: String,
    source_id: String,
    position_us: i64,
    threshold_us: i64,
}

impl SingleRequest {
    /// Create a request for one thumbnail at `position_us`.
    ///
    /// The tolerance defaults to zero (exact match or the closest frame at
    /// or after the position).
    pub fn new(
        source_path: impl Into<String>,
        source_id: impl Into<String>,
        position_us: i64,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            source_id: source_id.into(),
            position_us,
            threshold_us: 0,
        }
    }

    /// Set the tolerance in microseconds.
    pub fn with_threshold_us(mut self, threshold_us: i64) -> Self {
        self.threshold_us = threshold_us.max(0);
        self
    }
}

impl ThumbnailRequest for SingleRequest {
    fn source_path(&self) -> &str {
        &self.source_path
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn threshold_us(&self) -> i64 {
        self.threshold_us
    }

    fn locate(&self, duration_us: i64) -> Vec<i64> {
        vec![self.position_us.clamp(0, duration_us.max(0))]
    }
}

/// A request for `count` thumbnails spread evenly across the source.
///
/// Position `i` resolves to `i * duration / count`, so the spread starts at
/// the first frame and stops short of the very end.
///
/// # Example
///
/// ```
/// use keysnap::{SpreadRequest, ThumbnailRequest};
///
/// let request = SpreadRequest::new("clips/a.mp4", "a", 4);
/// assert_eq!(
///     request.locate(8_000_000),
///     vec![0, 2_000_000, 4_000_000, 6_000_000],
/// );
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct SpreadRequest {
    source_path: String,
    source_id: String,
    count: u32,
    threshold_us: i64,
}

impl SpreadRequest {
    /// Create a request for `count` evenly spaced thumbnails.
    pub fn new(
        source_path: impl Into<String>,
        source_id: impl Into<String>,
        count: u32,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            source_id: source_id.into(),
            count,
            threshold_us: 0,
        }
    }

    /// Set the tolerance in microseconds.
    pub fn with_threshold_us(mut self, threshold_us: i64) -> Self {
        self.threshold_us = threshold_us.max(0);
        self
    }
}

impl ThumbnailRequest for SpreadRequest {
    fn source_path(&self) -> &str {
        &self.source_path
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn threshold_us(&self) -> i64 {
        self.threshold_us
    }

    fn locate(&self, duration_us: i64) -> Vec<i64> {
        let duration_us = duration_us.max(0);
        (0..self.count as i64)
            .map(|index| index * duration_us / self.count.max(1) as i64)
            .collect()
    }
}

/// One produced thumbnail.
///
/// Carries the originating request, the timestamp that was asked for, and
/// the decoded image. The image's actual timestamp may differ from
/// `requested_us` by up to the request's tolerance (or overshoot it when the
/// stream has no frame inside the tolerance window).
#[derive(Clone)]
pub struct Thumbnail {
    /// The request this thumbnail satisfies.
    pub request: Arc<dyn ThumbnailRequest>,
    /// The target timestamp the caller asked for, in microseconds.
    pub requested_us: i64,
    /// The decoded still frame.
    pub image: DynamicImage,
}

impl Debug for Thumbnail {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Thumbnail")
            .field("source_id", &self.request.source_id())
            .field("requested_us", &self.requested_us)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}
