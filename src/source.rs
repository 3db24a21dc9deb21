//! The data-source collaborator interface.
//!
//! [`FrameSource`] is everything the engine needs from a media container:
//! identity, duration, a lazily extendable keyframe index, seek and
//! packet-read primitives, and a synchronous single-frame fallback. The
//! shipped FFmpeg implementation lives in [`crate::media`]; tests implement
//! the trait directly over synthetic data.
//!
//! [`RetargetOnEos`] is the forwarding decorator the pipeline reads through:
//! it delegates every operation to the wrapped source except the drained
//! probe, which additionally re-seeks to the next queued target so one
//! pipeline can serve requests past a previous end-of-stream.

use image::DynamicImage;

/// One encoded packet read from a source.
#[derive(Debug, Clone)]
pub struct SourceChunk {
    /// Encoded packet payload.
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds.
    pub pts_us: i64,
    /// Whether this packet starts at a random-access point.
    pub keyframe: bool,
}

/// A single video source the engine can schedule requests against.
///
/// Implementations own the demuxer state for one container. All methods are
/// bounded single-step work; in particular [`read_chunk`](FrameSource::read_chunk)
/// returns at most one packet and never blocks indefinitely.
pub trait FrameSource: Send {
    /// Stable identity of this source. Requests reference it via
    /// [`source_id`](crate::ThumbnailRequest::source_id).
    fn media_id(&self) -> &str;

    /// Path (or URL) of this source. Requests reference it via
    /// [`source_path`](crate::ThumbnailRequest::source_path).
    fn path(&self) -> &str;

    /// Total duration of the video track in microseconds.
    fn duration_us(&self) -> i64;

    /// Display orientation in degrees (0, 90, 180, 270).
    fn orientation(&self) -> i32 {
        0
    }

    /// Settle offset added to every planned seek target, compensating for
    /// the demuxer's seek granularity.
    fn seek_threshold_us(&self) -> i64 {
        0
    }

    /// The ascending keyframe timestamps discovered so far, in microseconds.
    fn keyframe_timestamps(&self) -> &[i64];

    /// Extend the keyframe index by one entry.
    ///
    /// Returns the newest discovered timestamp, or `None` once the stream
    /// holds no further keyframes.
    fn request_keyframe_timestamps(&mut self) -> Option<i64>;

    /// Seek the demuxer to `position_us`. Lands on the nearest preceding
    /// random-access point and clears any drained state.
    fn seek_to(&mut self, position_us: i64);

    /// Current demuxer read position in microseconds.
    fn position_us(&self) -> i64;

    /// Whether the demuxer has read past the last packet.
    fn is_drained(&mut self) -> bool;

    /// Whether a packet read may be attempted right now. Sources that are
    /// momentarily out of data (without being drained) return `false` so the
    /// pipeline reports idle instead of blocking.
    fn can_read(&self) -> bool {
        true
    }

    /// Read the next encoded video packet, or `None` when drained.
    fn read_chunk(&mut self) -> Option<SourceChunk>;

    /// Synchronously decode one frame at `position_us`, bypassing the
    /// pipeline. Used by the driving loop to recover from transient pipeline
    /// failures; `None` means the position could not be served.
    fn frame_at(&mut self, position_us: i64, width: u32, height: u32) -> Option<DynamicImage>;
}

/// Forwarding decorator that turns end-of-stream into a re-seek.
///
/// Every operation delegates to the wrapped source. [`is_drained`]
/// additionally seeks to `next_target_us` when the inner source reports
/// drained, so a pipeline that overshot the end keeps serving the remaining
/// queued targets instead of stalling.
///
/// [`is_drained`]: FrameSource::is_drained
pub struct RetargetOnEos<'a> {
    inner: &'a mut dyn FrameSource,
    next_target_us: i64,
}

impl<'a> RetargetOnEos<'a> {
    /// Wrap `inner`, retargeting to `next_target_us` on end-of-stream.
    ///
    /// Pass a negative target when the queue holds no further stubs; the
    /// drained state is then left untouched.
    pub fn new(inner: &'a mut dyn FrameSource, next_target_us: i64) -> Self {
        Self {
            inner,
            next_target_us,
        }
    }
}

impl FrameSource for RetargetOnEos<'_> {
    fn media_id(&self) -> &str {
        self.inner.media_id()
    }

    fn path(&self) -> &str {
        self.inner.path()
    }

    fn duration_us(&self) -> i64 {
        self.inner.duration_us()
    }

    fn orientation(&self) -> i32 {
        self.inner.orientation()
    }

    fn seek_threshold_us(&self) -> i64 {
        self.inner.seek_threshold_us()
    }

    fn keyframe_timestamps(&self) -> &[i64] {
        self.inner.keyframe_timestamps()
    }

    fn request_keyframe_timestamps(&mut self) -> Option<i64> {
        self.inner.request_keyframe_timestamps()
    }

    fn seek_to(&mut self, position_us: i64) {
        self.inner.seek_to(position_us);
    }

    fn position_us(&self) -> i64 {
        self.inner.position_us()
    }

    fn is_drained(&mut self) -> bool {
        if self.inner.is_drained() && self.next_target_us >= 0 {
            log::debug!(
                "source {} drained, retargeting to {}",
                self.inner.media_id(),
                self.next_target_us
            );
            self.inner.seek_to(self.next_target_us);
        }
        self.inner.is_drained()
    }

    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn read_chunk(&mut self) -> Option<SourceChunk> {
        self.inner.read_chunk()
    }

    fn frame_at(&mut self, position_us: i64, width: u32, height: u32) -> Option<DynamicImage> {
        self.inner.frame_at(position_us, width, height)
    }
}
