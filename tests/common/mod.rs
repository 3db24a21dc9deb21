//! Shared test doubles: a scripted [`FrameSource`] and a trivial decode
//! stage, so engine behavior can be exercised without media fixtures.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use keysnap::{
    DecoderStage, FrameOutputOptions, FrameSource, KeysnapError, PipelineFactory, PipelineStep,
    SourceChunk,
};

/// A synthetic video source backed by a scripted packet list.
///
/// Packets are generated at a fixed interval; packets whose timestamp
/// appears in the keyframe list are marked as sync points. Seeks land on the
/// nearest preceding keyframe packet, like a real demuxer. The keyframe
/// index starts empty and grows through `request_keyframe_timestamps`.
pub struct MockSource {
    name: String,
    duration_us: i64,
    keyframes: Vec<i64>,
    discovered: usize,
    chunks: Vec<SourceChunk>,
    cursor: usize,
    position_us: i64,
    drained: bool,
    endless: bool,
    serve_fallback: bool,
    seek_offset_us: i64,
    pub seeks: Arc<Mutex<Vec<i64>>>,
}

impl MockSource {
    pub fn new(name: &str, keyframes: &[i64], frame_interval_us: i64, duration_us: i64) -> Self {
        let mut chunks = Vec::new();
        let mut pts_us = 0;
        while pts_us <= duration_us {
            chunks.push(SourceChunk {
                data: Vec::new(),
                pts_us,
                keyframe: keyframes.contains(&pts_us),
            });
            pts_us += frame_interval_us;
        }
        Self {
            name: name.to_string(),
            duration_us,
            keyframes: keyframes.to_vec(),
            discovered: 0,
            chunks,
            cursor: 0,
            position_us: 0,
            drained: false,
            endless: false,
            serve_fallback: false,
            seek_offset_us: 0,
            seeks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A source that never drains and never yields packets, for parking the
    /// driving loop in its backoff state.
    pub fn endless(name: &str, duration_us: i64) -> Self {
        let mut source = Self::new(name, &[0], duration_us * 2, duration_us);
        source.chunks.clear();
        source.endless = true;
        source
    }

    /// Make `frame_at` succeed with a synthetic image.
    pub fn with_fallback_frames(mut self) -> Self {
        self.serve_fallback = true;
        self
    }

    /// Give the source a non-zero seek settle offset.
    pub fn with_seek_offset(mut self, offset_us: i64) -> Self {
        self.seek_offset_us = offset_us;
        self
    }

    /// Clone of the recorded seek targets.
    pub fn seek_log(&self) -> Arc<Mutex<Vec<i64>>> {
        Arc::clone(&self.seeks)
    }
}

impl FrameSource for MockSource {
    fn media_id(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.name
    }

    fn duration_us(&self) -> i64 {
        self.duration_us
    }

    fn seek_threshold_us(&self) -> i64 {
        self.seek_offset_us
    }

    fn keyframe_timestamps(&self) -> &[i64] {
        &self.keyframes[..self.discovered]
    }

    fn request_keyframe_timestamps(&mut self) -> Option<i64> {
        if self.discovered < self.keyframes.len() {
            self.discovered += 1;
            Some(self.keyframes[self.discovered - 1])
        } else {
            None
        }
    }

    fn seek_to(&mut self, position_us: i64) {
        if let Ok(mut seeks) = self.seeks.lock() {
            seeks.push(position_us);
        }
        self.cursor = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.keyframe && chunk.pts_us <= position_us)
            .map(|(index, _)| index)
            .next_back()
            .unwrap_or(0);
        self.position_us = position_us;
        self.drained = false;
    }

    fn position_us(&self) -> i64 {
        self.position_us
    }

    fn is_drained(&mut self) -> bool {
        if self.endless {
            return false;
        }
        self.drained
    }

    fn read_chunk(&mut self) -> Option<SourceChunk> {
        if self.endless || self.cursor >= self.chunks.len() {
            self.drained = !self.endless;
            return None;
        }
        let chunk = self.chunks[self.cursor].clone();
        self.cursor += 1;
        self.position_us = chunk.pts_us;
        Some(chunk)
    }

    fn frame_at(&mut self, _position_us: i64, width: u32, height: u32) -> Option<DynamicImage> {
        self.serve_fallback
            .then(|| DynamicImage::new_rgb8(width, height))
    }
}

/// A stage that turns every packet into a frame at the packet timestamp.
///
/// Can be scripted to stay idle forever or to fail a number of steps.
pub struct MockStage {
    idle: bool,
    failures: Arc<AtomicUsize>,
}

impl DecoderStage for MockStage {
    fn flush(&mut self) {}

    fn step(&mut self, source: &mut dyn FrameSource) -> Result<PipelineStep, KeysnapError> {
        if self.idle {
            return Ok(PipelineStep::Idle);
        }
        if self.failures.load(Ordering::Acquire) > 0 {
            self.failures.fetch_sub(1, Ordering::AcqRel);
            return Err(KeysnapError::Decode("scripted decode failure".to_string()));
        }
        if source.is_drained() {
            return Ok(PipelineStep::Idle);
        }
        match source.read_chunk() {
            Some(chunk) => Ok(PipelineStep::Frame {
                pts_us: chunk.pts_us,
                image: DynamicImage::new_rgb8(1, 1),
            }),
            None => Ok(PipelineStep::Idle),
        }
    }
}

/// Factory producing [`MockStage`]s, with counters shared across all stages
/// it creates.
pub struct MockFactory {
    idle: bool,
    failures: Arc<AtomicUsize>,
    pub created: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            idle: false,
            failures: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stages that never make progress.
    pub fn idle() -> Self {
        Self {
            idle: true,
            ..Self::new()
        }
    }

    /// Stages that fail their first `failures` steps.
    pub fn failing(failures: usize) -> Self {
        let factory = Self::new();
        factory.failures.store(failures, Ordering::Release);
        factory
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}

impl PipelineFactory for MockFactory {
    fn create(
        &self,
        _source: &mut dyn FrameSource,
        _output: &FrameOutputOptions,
    ) -> Result<Box<dyn DecoderStage>, KeysnapError> {
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockStage {
            idle: self.idle,
            failures: Arc::clone(&self.failures),
        }))
    }
}
