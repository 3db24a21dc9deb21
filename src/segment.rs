//! Per-source pipeline lifecycle.
//!
//! A [`Segment`] owns the decoder/renderer resources for exactly one source.
//! Each [`advance`](Segment::advance) call drives a single bounded cycle:
//! consult the seek planner, apply the planned seek, flush once if required,
//! then run one decode step and test the produced frame against the current
//! fetch target. Segments are created lazily through a [`PipelineFactory`]
//! and released explicitly; release operations are idempotent no-ops.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use image::DynamicImage;

use crate::error::KeysnapError;
use crate::options::FrameOutputOptions;
use crate::planner::{SeekState, plan_seek};
use crate::source::{FrameSource, RetargetOnEos};

/// What a single decode step produced.
#[derive(Debug)]
pub enum PipelineStep {
    /// Nothing happened; the stage is waiting on upstream data.
    Idle,
    /// Work was done (packet consumed, frame dropped) but no frame surfaced.
    Progressed,
    /// A decoded frame surfaced.
    Frame {
        /// Presentation timestamp of the frame in microseconds.
        pts_us: i64,
        /// The decoded, scaled frame.
        image: DynamicImage,
    },
}

/// The decode/render collaborator driven by a [`Segment`].
///
/// `step` performs bounded single-step work — it must never block
/// indefinitely. A stalled decoder is reported as [`PipelineStep::Idle`],
/// letting the driving loop back off instead of spinning.
pub trait DecoderStage: Send {
    /// Discard buffered decoder state. Called once after a planned seek
    /// that requires it.
    fn flush(&mut self);

    /// Run one decode cycle against `source`.
    fn step(&mut self, source: &mut dyn FrameSource) -> Result<PipelineStep, KeysnapError>;
}

/// Builds a [`DecoderStage`] for a source.
pub trait PipelineFactory: Send + Sync {
    /// Create a fresh decode stage for `source` with the given output
    /// settings.
    fn create(
        &self,
        source: &mut dyn FrameSource,
        output: &FrameOutputOptions,
    ) -> Result<Box<dyn DecoderStage>, KeysnapError>;
}

/// The head stub's target, as seen by one advance cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchTarget {
    pub localized_us: i64,
    pub threshold_us: i64,
}

impl FetchTarget {
    /// Whether a frame at `pts_us` satisfies this target.
    ///
    /// Within tolerance on either side, or anywhere past the target — the
    /// overshoot catch keeps a sparse stream from stalling the queue head.
    fn satisfied_by(&self, pts_us: i64) -> bool {
        (pts_us - self.localized_us).abs() <= self.threshold_us || pts_us > self.localized_us
    }
}

/// Outcome of one [`Segment::advance`] cycle.
pub(crate) enum AdvanceOutcome {
    /// No observable progress.
    Idle,
    /// Progress was made; call again without delay.
    Progressed,
    /// A frame satisfying the fetch target was produced.
    Snapshot { pts_us: i64, image: DynamicImage },
}

/// The live pipeline for one source.
pub(crate) struct Segment {
    stage: Box<dyn DecoderStage>,
    pub state: SeekState,
}

impl Segment {
    fn new(stage: Box<dyn DecoderStage>) -> Self {
        Self {
            stage,
            state: SeekState::new(),
        }
    }

    /// Drive one seek→read→decode→render→snapshot cycle.
    ///
    /// `next_target_us` is the target a drained source should retarget to
    /// (negative when the queue holds nothing further).
    pub fn advance(
        &mut self,
        source: &mut dyn FrameSource,
        fetch: Option<FetchTarget>,
        next_target_us: i64,
    ) -> Result<AdvanceOutcome, KeysnapError> {
        if let Some(fetch) = fetch {
            let decision = plan_seek(
                source,
                &mut self.state,
                fetch.localized_us,
                fetch.threshold_us,
            );
            if let Some(seek_us) = decision.seek_to_us {
                source.seek_to(seek_us);
            }
        }

        if self.state.flush_pending {
            self.stage.flush();
            self.state.flush_pending = false;
        }

        let mut retargeting = RetargetOnEos::new(source, next_target_us);
        let step = self.stage.step(&mut retargeting)?;

        Ok(match step {
            PipelineStep::Idle => AdvanceOutcome::Idle,
            PipelineStep::Progressed => AdvanceOutcome::Progressed,
            PipelineStep::Frame { pts_us, image } => match fetch {
                Some(fetch) if fetch.satisfied_by(pts_us) => {
                    AdvanceOutcome::Snapshot { pts_us, image }
                }
                // Frame earlier than the tolerance window: dropped, but the
                // decoder moved forward.
                _ => AdvanceOutcome::Progressed,
            },
        })
    }
}

/// All open segments, keyed by source identity.
///
/// At most one pipeline is live at a time: switching the queue head to a
/// different source tears down the previous pipeline and builds a fresh one
/// with fresh seek state.
#[derive(Default)]
pub(crate) struct SegmentTable {
    segments: HashMap<String, Segment>,
    released: HashSet<String>,
    active_id: Option<String>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the segment for `source`, creating it lazily.
    pub fn activate(
        &mut self,
        source: &mut dyn FrameSource,
        factory: &dyn PipelineFactory,
        output: &FrameOutputOptions,
    ) -> Result<&mut Segment, KeysnapError> {
        let id = source.media_id().to_string();
        if self.released.contains(&id) {
            return Err(KeysnapError::SegmentReleased { id });
        }

        if self.active_id.as_deref() != Some(id.as_str()) {
            if let Some(previous) = self.active_id.take() {
                if self.segments.remove(&previous).is_some() {
                    log::debug!("dropped pipeline for {previous} on source switch");
                }
            }
            self.active_id = Some(id.clone());
        }

        let segment = match self.segments.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                log::debug!("creating pipeline for source {}", entry.key());
                let stage = factory.create(source, output)?;
                entry.insert(Segment::new(stage))
            }
        };
        Ok(segment)
    }

    /// Request a re-plan on the segment for `id`, if one is open.
    pub fn request_replan(&mut self, id: &str) {
        if let Some(segment) = self.segments.get_mut(id) {
            segment.state.request_replan();
        }
    }

    /// Ids of all open segments.
    pub fn open_ids(&self) -> Vec<String> {
        self.segments.keys().cloned().collect()
    }

    /// Release the segment for `id`. Idempotent: releasing an absent or
    /// already-released segment is a no-op.
    pub fn release_segment(&mut self, id: &str) {
        if self.segments.remove(id).is_some() {
            log::debug!("released segment for source {id}");
        }
        self.released.insert(id.to_string());
        if self.active_id.as_deref() == Some(id) {
            self.active_id = None;
        }
    }

    /// Tear down every open segment at the end of a drain. Idempotent.
    ///
    /// Unlike [`release_segment`](Self::release_segment) this does not bar
    /// the ids: the next batch re-creates pipelines lazily. Only an
    /// explicitly removed source stays barred until reinstated.
    pub fn release_all(&mut self) {
        self.segments.clear();
        self.active_id = None;
    }

    /// Allow a new segment for `id` again (the source was re-added).
    pub fn reinstate(&mut self, id: &str) {
        self.released.remove(id);
    }
}
