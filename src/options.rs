//! Engine configuration.
//!
//! [`EngineOptions`] is a builder that carries output sizing, the fallback
//! thumbnail dimensions, the driving-loop backoff interval, the result
//! channel capacity, and an optional externally supplied cancellation token.

use std::time::Duration;

use crate::cancel::CancellationToken;

/// Frame output settings for decoded thumbnails.
///
/// When no dimensions are set the source resolution is used. Setting one
/// dimension with `maintain_aspect_ratio` computes the other automatically.
#[derive(Debug, Clone)]
pub struct FrameOutputOptions {
    /// Target width. `None` keeps the source width.
    pub width: Option<u32>,
    /// Target height. `None` keeps the source height.
    pub height: Option<u32>,
    /// When `true` and only one dimension is specified, the other is
    /// computed to preserve the source aspect ratio.
    pub maintain_aspect_ratio: bool,
}

impl Default for FrameOutputOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            maintain_aspect_ratio: true,
        }
    }
}

impl FrameOutputOptions {
    /// Resolve the final output dimensions given the source size.
    ///
    /// Returns `(width, height)`.
    pub(crate) fn resolve_dimensions(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) if self.maintain_aspect_ratio && source_width > 0 => {
                let ratio = w as f64 / source_width as f64;
                let h = (source_height as f64 * ratio).round() as u32;
                (w, h.max(1))
            }
            (Some(w), None) => (w, source_height),
            (None, Some(h)) if self.maintain_aspect_ratio && source_height > 0 => {
                let ratio = h as f64 / source_height as f64;
                let w = (source_width as f64 * ratio).round() as u32;
                (w.max(1), h)
            }
            (None, Some(h)) => (source_width, h),
            (None, None) => (source_width, source_height),
        }
    }
}

/// Configuration for a [`ThumbnailEngine`](crate::ThumbnailEngine).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use keysnap::EngineOptions;
///
/// let options = EngineOptions::new()
///     .with_resolution(Some(320), None)
///     .with_backoff(Duration::from_millis(5))
///     .with_channel_capacity(32);
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct EngineOptions {
    /// Output sizing for pipeline-decoded thumbnails.
    pub(crate) output: FrameOutputOptions,
    /// Width passed to the fallback extractor.
    pub(crate) fallback_width: u32,
    /// Height passed to the fallback extractor.
    pub(crate) fallback_height: u32,
    /// How long the driving loop waits when no progress was made but
    /// progress is still possible.
    pub(crate) backoff: Duration,
    /// Bound of the result channel.
    pub(crate) channel_capacity: usize,
    /// Externally supplied cancellation token, if any.
    pub(crate) cancellation: Option<CancellationToken>,
}

impl EngineOptions {
    /// Create options with defaults: source resolution output, 150×150
    /// fallback thumbnails, 5 ms backoff, a 64-item result channel.
    pub fn new() -> Self {
        Self {
            output: FrameOutputOptions::default(),
            fallback_width: 150,
            fallback_height: 150,
            backoff: Duration::from_millis(5),
            channel_capacity: 64,
            cancellation: None,
        }
    }

    /// Set a custom output resolution for decoded thumbnails.
    ///
    /// Pass `None` for either dimension to keep the source value; the other
    /// dimension is derived preserving aspect ratio.
    pub fn with_resolution(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.output.width = width;
        self.output.height = height;
        self
    }

    /// Control whether aspect ratio is preserved when only one output
    /// dimension is specified. Defaults to `true`.
    pub fn with_maintain_aspect_ratio(mut self, maintain: bool) -> Self {
        self.output.maintain_aspect_ratio = maintain;
        self
    }

    /// Set the dimensions requested from the fallback extractor.
    pub fn with_fallback_dimensions(mut self, width: u32, height: u32) -> Self {
        self.fallback_width = width.max(1);
        self.fallback_height = height.max(1);
        self
    }

    /// Set the driving-loop backoff interval.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the result channel capacity. Clamped to a minimum of 1.
    ///
    /// Kept small by default to avoid buffering many decoded frames; when
    /// the buffer is full new thumbnails are dropped, not queued.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Attach an externally owned cancellation token.
    ///
    /// When omitted the engine creates its own, obtainable via
    /// [`cancellation_token`](crate::ThumbnailEngine::cancellation_token).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}
