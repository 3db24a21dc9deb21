//! The keyframe-aware seek planner.
//!
//! Once per decode cycle the driving loop asks [`plan_seek`] whether the
//! active pipeline should seek before continuing, and whether buffered
//! decoder state must be flushed. The decision balances the two costs of
//! reaching a target timestamp: a backward seek restarts decode from a
//! keyframe (expensive on hardware pipelines), while forward linear decode
//! is cheap but only viable within the request's tolerance of a keyframe
//! boundary.
//!
//! The planner is a pure function over explicit [`SeekState`]; it has no
//! ambient flags. It may extend the source's lazily built keyframe index
//! while searching.

use crate::source::FrameSource;

/// Per-pipeline seek/flush flags, owned by the driving loop and threaded
/// explicitly through each cycle.
///
/// `seek_pending` is set whenever the queue head changes (a stub completed,
/// was cancelled, or a new pipeline was built) and cleared by the planner so
/// repeated cycles against the same head do not re-seek. `flush_pending` is
/// set by the planner and consumed once by the decode stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekState {
    /// A re-plan is required before the next decode step.
    pub seek_pending: bool,
    /// Buffered decoder state must be discarded before the next decode step.
    pub flush_pending: bool,
}

impl SeekState {
    /// State for a freshly built pipeline: plan on the first cycle, nothing
    /// to flush yet.
    pub fn new() -> Self {
        Self {
            seek_pending: true,
            flush_pending: false,
        }
    }

    /// Request a re-plan on the next cycle (head stub changed).
    pub fn request_replan(&mut self) {
        self.seek_pending = true;
    }
}

impl Default for SeekState {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of one planning cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekDecision {
    /// Where to seek before the next read, or `None` to continue linear
    /// decode from the current position.
    pub seek_to_us: Option<i64>,
    /// Whether buffered decoder frames must be discarded.
    pub flush: bool,
}

impl SeekDecision {
    const NO_SEEK: Self = Self {
        seek_to_us: None,
        flush: false,
    };
}

/// Decide whether and where the active pipeline should seek for `target_us`.
///
/// Returns a no-op decision when no seek is pending or `target_us` is
/// negative (no head stub). Otherwise:
///
/// 1. `next` = first keyframe at or after the target, extending the index as
///    needed (`i64::MAX` past end of stream).
/// 2. `previous` = the keyframe before `next`, or the last known keyframe
///    when `next` is the first index entry.
/// 3. If `next − target ≤ threshold`, overshooting to `next` is within
///    tolerance and cheaper than rewinding — seek there and flush.
/// 4. Otherwise seek to `previous` — but only when a seek is actually
///    required: the decoder already passed `previous`, or it has drifted
///    more than `threshold` past the target. If neither holds, the target is
///    reachable by linear decode and no seek is planned.
///
/// Clears `seek_pending` in every taken cycle and records the flush
/// requirement in `flush_pending`.
pub fn plan_seek(
    source: &mut dyn FrameSource,
    state: &mut SeekState,
    target_us: i64,
    threshold_us: i64,
) -> SeekDecision {
    if !state.seek_pending || target_us < 0 {
        return SeekDecision::NO_SEEK;
    }
    state.seek_pending = false;

    let current_us = source.position_us();
    let next_index = next_keyframe_index(source, target_us);
    let keyframes = source.keyframe_timestamps();
    let Some(&last_keyframe_us) = keyframes.last() else {
        // No keyframes discovered at all; nothing to plan against.
        return SeekDecision::NO_SEEK;
    };

    let next_keyframe_us = match next_index {
        Some(index) => keyframes[index],
        None => i64::MAX,
    };
    let previous_keyframe_us = match next_index {
        Some(0) | None => last_keyframe_us,
        Some(index) => keyframes[index - 1],
    };

    let right_gap = next_keyframe_us.saturating_sub(target_us);
    let next_within_threshold = right_gap <= threshold_us;
    let seek = next_within_threshold
        || previous_keyframe_us > current_us
        || current_us - target_us > threshold_us;
    state.flush_pending = seek;

    if !seek {
        log::debug!(
            "plan: current={current_us} target={target_us} within linear reach, no seek"
        );
        return SeekDecision::NO_SEEK;
    }

    let chosen_us = if next_within_threshold {
        next_keyframe_us
    } else {
        previous_keyframe_us
    };
    let seek_to_us = chosen_us.saturating_add(source.seek_threshold_us());
    log::debug!(
        "plan: current={current_us} target={target_us} threshold={threshold_us} \
         next_kf={next_keyframe_us} prev_kf={previous_keyframe_us} seek_to={seek_to_us}"
    );
    SeekDecision {
        seek_to_us: Some(seek_to_us),
        flush: true,
    }
}

/// Index of the first keyframe at or after `target_us`, extending the lazy
/// index until it covers the target. `None` means the stream ends before any
/// such keyframe.
pub(crate) fn next_keyframe_index(
    source: &mut dyn FrameSource,
    target_us: i64,
) -> Option<usize> {
    if source.keyframe_timestamps().is_empty() {
        source.request_keyframe_timestamps()?;
    }
    loop {
        let keyframes = source.keyframe_timestamps();
        match keyframes.binary_search(&target_us) {
            Ok(index) => return Some(index),
            Err(index) if index < keyframes.len() => return Some(index),
            Err(_) => {
                // Index does not cover the target yet; grow it by one entry.
                source.request_keyframe_timestamps()?;
            }
        }
    }
}

/// The bucketing key for `target_us`: the timestamp of its preceding
/// keyframe (the point a pipeline would seek to before decoding forward).
///
/// Mirrors the planner's previous-keyframe rule, falling back to the last
/// known keyframe, or `-1` when the index is empty and cannot be extended.
pub(crate) fn preceding_keyframe_us(source: &mut dyn FrameSource, target_us: i64) -> i64 {
    let next_index = next_keyframe_index(source, target_us);
    let keyframes = source.keyframe_timestamps();
    match next_index {
        Some(0) | None => keyframes.last().copied().unwrap_or(-1),
        Some(index) => keyframes[index - 1],
    }
}
