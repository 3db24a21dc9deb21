//! FFmpeg-backed collaborators.
//!
//! [`MediaSource`] implements [`FrameSource`] over an FFmpeg demuxer with a
//! lazily extended keyframe index, and [`MediaPipeline`] implements
//! [`DecoderStage`] as a decode-and-scale stage producing RGB8 images.
//! [`MediaPipelineFactory`] wires the two together and is the default
//! factory used by [`ThumbnailEngine::new`](crate::ThumbnailEngine::new).
//!
//! Timestamps cross these boundaries in microseconds: packet timestamps are
//! converted out of the stream time base on read, fed to the decoder as-is,
//! and echoed back on decoded frames.

use ffmpeg_next::{
    Error as FfmpegError, Packet, Rational,
    codec::context::Context as CodecContext,
    decoder::Video as VideoDecoder,
    format::{Pixel, context::Input, input},
    frame::Video as VideoFrame,
    media::Type,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};
use image::{DynamicImage, RgbImage};

use crate::error::KeysnapError;
use crate::options::FrameOutputOptions;
use crate::segment::{DecoderStage, PipelineFactory, PipelineStep};
use crate::source::{FrameSource, SourceChunk};

/// Convert a stream-time-base timestamp to microseconds.
fn timestamp_to_micros(timestamp: i64, time_base: Rational) -> i64 {
    let seconds = timestamp as f64 * time_base.numerator() as f64
        / time_base.denominator().max(1) as f64;
    (seconds * 1_000_000.0).round() as i64
}

/// An FFmpeg demuxer exposed as a [`FrameSource`].
///
/// Owns two format contexts over the same file: the demux context the
/// pipeline reads packets from, and a lazily opened scan context that walks
/// ahead discovering keyframe timestamps without disturbing the read
/// position.
///
/// # Example
///
/// ```no_run
/// use keysnap::MediaSource;
///
/// let source = MediaSource::open("input.mp4")?;
/// println!("duration: {} us", keysnap::FrameSource::duration_us(&source));
/// # Ok::<(), keysnap::KeysnapError>(())
/// ```
pub struct MediaSource {
    path: String,
    media_id: String,
    input: Input,
    scan: Option<Input>,
    scan_exhausted: bool,
    video_stream_index: usize,
    time_base: Rational,
    duration_us: i64,
    orientation: i32,
    keyframes: Vec<i64>,
    position_us: i64,
    drained: bool,
}

impl MediaSource {
    /// Open a media file.
    ///
    /// The source identity defaults to the path; override it with
    /// [`with_media_id`](MediaSource::with_media_id) when scheduling several
    /// sources over the same file.
    ///
    /// # Errors
    ///
    /// - [`KeysnapError::SourceOpen`] if the file cannot be opened.
    /// - [`KeysnapError::NoVideoStream`] if it has no video track.
    pub fn open(path: impl Into<String>) -> Result<Self, KeysnapError> {
        let path = path.into();

        ffmpeg_next::init().map_err(|error| KeysnapError::SourceOpen {
            path: path.clone(),
            reason: format!("FFmpeg initialization failed: {error}"),
        })?;

        let ictx = input(&path).map_err(|error| KeysnapError::SourceOpen {
            path: path.clone(),
            reason: error.to_string(),
        })?;

        let stream = ictx
            .streams()
            .best(Type::Video)
            .ok_or(KeysnapError::NoVideoStream)?;
        let video_stream_index = stream.index();
        let time_base = stream.time_base();
        let orientation = stream
            .metadata()
            .get("rotate")
            .and_then(|value| value.parse::<i32>().ok())
            .map(|degrees| degrees.rem_euclid(360))
            .unwrap_or(0);

        // Container duration is reported in AV_TIME_BASE units, which are
        // microseconds already.
        let duration_us = ictx.duration().max(0);

        log::debug!(
            "opened {path}: stream={video_stream_index} duration={duration_us}us rotation={orientation}"
        );

        Ok(Self {
            media_id: path.clone(),
            path,
            input: ictx,
            scan: None,
            scan_exhausted: false,
            video_stream_index,
            time_base,
            duration_us,
            orientation,
            keyframes: Vec::new(),
            position_us: 0,
            drained: false,
        })
    }

    /// Replace the default identity (the path) with an explicit id.
    #[must_use]
    pub fn with_media_id(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = media_id.into();
        self
    }
}

impl FrameSource for MediaSource {
    fn media_id(&self) -> &str {
        &self.media_id
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn duration_us(&self) -> i64 {
        self.duration_us
    }

    fn orientation(&self) -> i32 {
        self.orientation
    }

    fn keyframe_timestamps(&self) -> &[i64] {
        &self.keyframes
    }

    fn request_keyframe_timestamps(&mut self) -> Option<i64> {
        if self.scan_exhausted {
            return None;
        }

        if self.scan.is_none() {
            match input(&self.path) {
                Ok(scan) => self.scan = Some(scan),
                Err(error) => {
                    log::debug!("keyframe scan open failed for {}: {error}", self.path);
                    self.scan_exhausted = true;
                    return None;
                }
            }
        }
        let scan = self.scan.as_mut()?;

        let mut packet = Packet::empty();
        loop {
            match packet.read(scan) {
                Ok(()) => {
                    if packet.stream() as usize != self.video_stream_index || !packet.is_key() {
                        continue;
                    }
                    let Some(pts) = packet.pts().or_else(|| packet.dts()) else {
                        continue;
                    };
                    let pts_us = timestamp_to_micros(pts, self.time_base);
                    // Keep the index strictly ascending.
                    if self.keyframes.last().is_some_and(|last| pts_us <= *last) {
                        continue;
                    }
                    self.keyframes.push(pts_us);
                    return Some(pts_us);
                }
                Err(FfmpegError::Eof) => {
                    self.scan = None;
                    self.scan_exhausted = true;
                    return None;
                }
                Err(error) => {
                    log::debug!("keyframe scan failed for {}: {error}", self.path);
                    self.scan = None;
                    self.scan_exhausted = true;
                    return None;
                }
            }
        }
    }

    fn seek_to(&mut self, position_us: i64) {
        // Container-level seek uses AV_TIME_BASE units, i.e. microseconds.
        // The upper bound keeps the landing point at or before the target.
        if let Err(error) = self.input.seek(position_us, ..position_us) {
            log::warn!("seek to {position_us} failed for {}: {error}", self.path);
            return;
        }
        self.position_us = position_us;
        self.drained = false;
    }

    fn position_us(&self) -> i64 {
        self.position_us
    }

    fn is_drained(&mut self) -> bool {
        self.drained
    }

    fn can_read(&self) -> bool {
        !self.drained
    }

    fn read_chunk(&mut self) -> Option<SourceChunk> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() as usize != self.video_stream_index {
                        continue;
                    }
                    let pts = packet.pts().or_else(|| packet.dts()).unwrap_or(0);
                    let pts_us = timestamp_to_micros(pts, self.time_base);
                    self.position_us = pts_us;
                    return Some(SourceChunk {
                        data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                        pts_us,
                        keyframe: packet.is_key(),
                    });
                }
                Err(FfmpegError::Eof) => {
                    self.drained = true;
                    return None;
                }
                Err(error) => {
                    log::warn!("packet read failed for {}: {error}", self.path);
                    self.drained = true;
                    return None;
                }
            }
        }
    }

    fn frame_at(&mut self, position_us: i64, width: u32, height: u32) -> Option<DynamicImage> {
        match extract_frame(&self.path, position_us, width, height) {
            Ok(image) => Some(image),
            Err(error) => {
                log::debug!(
                    "direct extraction at {position_us} failed for {}: {error}",
                    self.path
                );
                None
            }
        }
    }
}

/// Decode a single frame at `position_us` through a short-lived demuxer and
/// decoder, independent of any pipeline state.
fn extract_frame(
    path: &str,
    position_us: i64,
    width: u32,
    height: u32,
) -> Result<DynamicImage, KeysnapError> {
    let mut ictx = input(&path)?;
    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or(KeysnapError::NoVideoStream)?;
    let video_stream_index = stream.index();
    let time_base = stream.time_base();

    let decoder_context = CodecContext::from_parameters(stream.parameters())?;
    let mut decoder = decoder_context.decoder().video()?;
    let mut scaler = ScalingContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::RGB24,
        width,
        height,
        ScalingFlags::BILINEAR,
    )?;

    ictx.seek(position_us, ..position_us)?;

    let mut decoded_frame = VideoFrame::empty();
    let mut rgb_frame = VideoFrame::empty();

    for (stream, packet) in ictx.packets() {
        if stream.index() != video_stream_index {
            continue;
        }
        decoder.send_packet(&packet)?;
        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            let pts_us = timestamp_to_micros(decoded_frame.pts().unwrap_or(0), time_base);
            if pts_us >= position_us {
                scaler.run(&decoded_frame, &mut rgb_frame)?;
                return frame_to_image(&rgb_frame, width, height);
            }
        }
    }

    // Flush: the target sits past the last packet, serve the final frame.
    decoder.send_eof()?;
    if decoder.receive_frame(&mut decoded_frame).is_ok() {
        scaler.run(&decoded_frame, &mut rgb_frame)?;
        return frame_to_image(&rgb_frame, width, height);
    }

    Err(KeysnapError::Decode(format!(
        "no frame found at {position_us} in {path}"
    )))
}

/// Copy a scaled RGB24 frame into an [`image`] buffer, honoring the plane
/// stride.
fn frame_to_image(
    rgb_frame: &VideoFrame,
    width: u32,
    height: u32,
) -> Result<DynamicImage, KeysnapError> {
    let stride = rgb_frame.stride(0);
    let row_bytes = (width as usize) * 3;
    let data = rgb_frame.data(0);

    let buffer = if stride == row_bytes {
        data[..row_bytes * (height as usize)].to_vec()
    } else {
        let mut buffer = Vec::with_capacity(row_bytes * (height as usize));
        for row in 0..(height as usize) {
            let row_start = row * stride;
            buffer.extend_from_slice(&data[row_start..row_start + row_bytes]);
        }
        buffer
    };

    let rgb_image = RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
        KeysnapError::Decode("failed to construct RGB image from decoded frame data".to_string())
    })?;
    Ok(DynamicImage::ImageRgb8(rgb_image))
}

/// The FFmpeg decode stage.
///
/// One step drains a buffered frame if the decoder holds one, otherwise
/// feeds it the next packet (or end-of-stream, once, when the source is
/// drained). Decoded frames are scaled to the configured output size and
/// converted to RGB8.
pub struct MediaPipeline {
    decoder: VideoDecoder,
    scaler: ScalingContext,
    output_width: u32,
    output_height: u32,
    eof_sent: bool,
}

// SAFETY: the scaler's underlying SwsContext pointer is uniquely owned by
// this pipeline and has no thread affinity; moving the pipeline between
// threads is sound.
unsafe impl Send for MediaPipeline {}

impl MediaPipeline {
    fn render(&mut self, decoded_frame: &VideoFrame) -> Result<PipelineStep, KeysnapError> {
        let mut rgb_frame = VideoFrame::empty();
        self.scaler.run(decoded_frame, &mut rgb_frame)?;
        let pts_us = decoded_frame.pts().unwrap_or(0);
        let image = frame_to_image(&rgb_frame, self.output_width, self.output_height)?;
        Ok(PipelineStep::Frame { pts_us, image })
    }
}

impl DecoderStage for MediaPipeline {
    fn flush(&mut self) {
        self.decoder.flush();
        self.eof_sent = false;
    }

    fn step(&mut self, source: &mut dyn FrameSource) -> Result<PipelineStep, KeysnapError> {
        // Frames buffered by a previous packet come out first.
        let mut decoded_frame = VideoFrame::empty();
        if self.decoder.receive_frame(&mut decoded_frame).is_ok() {
            return self.render(&decoded_frame);
        }

        // The drained probe may retarget the source to a further queued
        // position, in which case it comes back un-drained.
        if source.is_drained() {
            if !self.eof_sent {
                self.eof_sent = true;
                self.decoder.send_eof()?;
                return Ok(PipelineStep::Progressed);
            }
            return Ok(PipelineStep::Idle);
        }

        // A retarget after end-of-stream needs the decoder reopened for
        // input before it accepts packets again.
        if self.eof_sent {
            self.decoder.flush();
            self.eof_sent = false;
        }

        if !source.can_read() {
            return Ok(PipelineStep::Idle);
        }

        match source.read_chunk() {
            Some(chunk) => {
                let mut packet = Packet::copy(&chunk.data);
                packet.set_pts(Some(chunk.pts_us));
                packet.set_dts(Some(chunk.pts_us));
                self.decoder
                    .send_packet(&packet)
                    .map_err(|error| KeysnapError::Decode(error.to_string()))?;
                Ok(PipelineStep::Progressed)
            }
            None => Ok(PipelineStep::Idle),
        }
    }
}

/// Builds [`MediaPipeline`]s; the default [`PipelineFactory`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MediaPipelineFactory;

impl MediaPipelineFactory {
    pub fn new() -> Self {
        Self
    }
}

impl PipelineFactory for MediaPipelineFactory {
    fn create(
        &self,
        source: &mut dyn FrameSource,
        output: &FrameOutputOptions,
    ) -> Result<Box<dyn DecoderStage>, KeysnapError> {
        // Re-open the container for codec parameters; the engine's demux
        // handle stays where the planner put it.
        let ictx = input(&source.path())?;
        let stream = ictx
            .streams()
            .best(Type::Video)
            .ok_or(KeysnapError::NoVideoStream)?;
        let decoder_context = CodecContext::from_parameters(stream.parameters())?;
        let decoder = decoder_context.decoder().video()?;

        let (output_width, output_height) =
            output.resolve_dimensions(decoder.width(), decoder.height());
        let scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            output_width,
            output_height,
            ScalingFlags::BILINEAR,
        )?;
        log::debug!(
            "pipeline for {}: {}x{} -> {output_width}x{output_height}",
            source.media_id(),
            decoder.width(),
            decoder.height(),
        );

        Ok(Box::new(MediaPipeline {
            decoder,
            scaler,
            output_width,
            output_height,
            eof_sent: false,
        }))
    }
}
