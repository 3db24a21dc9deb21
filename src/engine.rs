//! The thumbnail engine: source table, request queue, and driving loop.
//!
//! [`ThumbnailEngine`] is the public entry point. Callers register sources,
//! enqueue batches of requests, and consume completed thumbnails from the
//! result stream. One logical task owns the drive; external mutation
//! (add/remove source, cancel) serializes with it through the engine mutex,
//! so the queue and segment table only ever see one writer at a time.
//!
//! `enqueue` blocks until the queue drains or the drive is cancelled. Async
//! callers should run it under `tokio::task::spawn_blocking`, the usual
//! split for CPU-bound decode work.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};
use std::thread;

use crate::cancel::CancellationToken;
use crate::channel::{ResultSender, SharedReceiver, ThumbnailStream, result_channel};
use crate::error::KeysnapError;
use crate::media::MediaPipelineFactory;
use crate::options::EngineOptions;
use crate::queue::{RequestQueue, Stub, bucket_by_keyframe};
use crate::request::{SingleRequest, Thumbnail, ThumbnailRequest};
use crate::segment::{AdvanceOutcome, FetchTarget, PipelineFactory, SegmentTable};
use crate::source::FrameSource;

/// State guarded by the engine mutex: the single-writer domain.
struct Shared {
    sources: Vec<Box<dyn FrameSource>>,
    queue: RequestQueue,
    segments: SegmentTable,
}

/// Keyframe-aware thumbnail extraction engine.
///
/// Cloneable handle; all clones share the same queue, sources, segments,
/// and result channel.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use keysnap::{EngineOptions, MediaSource, SingleRequest, ThumbnailEngine};
///
/// # fn example() -> Result<(), keysnap::KeysnapError> {
/// let engine = ThumbnailEngine::new(EngineOptions::new().with_resolution(Some(320), None));
/// engine.add_source(Box::new(MediaSource::open("clips/a.mp4")?));
///
/// let request = SingleRequest::new("clips/a.mp4", "clips/a.mp4", 2_000_000)
///     .with_threshold_us(500_000);
/// engine.enqueue(vec![Arc::new(request)])?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ThumbnailEngine {
    shared: Arc<Mutex<Shared>>,
    factory: Arc<dyn PipelineFactory>,
    sender: ResultSender,
    receiver: SharedReceiver,
    cancellation: CancellationToken,
    more_requests_expected: Arc<AtomicBool>,
    options: EngineOptions,
}

impl ThumbnailEngine {
    /// Create an engine backed by the FFmpeg pipeline factory.
    pub fn new(options: EngineOptions) -> Self {
        Self::with_factory(options, Arc::new(MediaPipelineFactory::new()))
    }

    /// Create an engine with a custom pipeline factory.
    ///
    /// Used to swap in alternative decode stages (or mocks in tests).
    pub fn with_factory(options: EngineOptions, factory: Arc<dyn PipelineFactory>) -> Self {
        let (sender, receiver) = result_channel(options.channel_capacity);
        let cancellation = options.cancellation.clone().unwrap_or_default();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                sources: Vec::new(),
                queue: RequestQueue::new(),
                segments: SegmentTable::new(),
            })),
            factory,
            sender,
            receiver,
            cancellation,
            more_requests_expected: Arc::new(AtomicBool::new(false)),
            options,
        }
    }

    /// Register a source. A source whose id is already present is ignored.
    pub fn add_source(&self, source: Box<dyn FrameSource>) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        if shared
            .sources
            .iter()
            .any(|existing| existing.media_id() == source.media_id())
        {
            log::debug!("source {} already registered", source.media_id());
            return;
        }
        shared.segments.reinstate(source.media_id());
        log::debug!("added source {}", source.media_id());
        shared.sources.push(source);
    }

    /// Remove a source: releases its segment and bulk-cancels every pending
    /// stub for it. Unknown ids are a no-op.
    pub fn remove_source(&self, source_id: &str) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        shared.segments.release_segment(source_id);
        let cancelled = shared.queue.remove_for_source(source_id);
        shared.sources.retain(|source| source.media_id() != source_id);
        Self::replan_head(shared);
        log::debug!("removed source {source_id}, cancelled {cancelled} pending stubs");
    }

    /// Reconcile the source table against `sources`: ids not yet registered
    /// are added, registered ids missing from `sources` are removed.
    pub fn update_sources(&self, sources: Vec<Box<dyn FrameSource>>) {
        let new_ids: Vec<String> = sources
            .iter()
            .map(|source| source.media_id().to_string())
            .collect();
        let current_ids: Vec<String> = {
            let guard = self.lock();
            guard
                .sources
                .iter()
                .map(|source| source.media_id().to_string())
                .collect()
        };

        for source in sources {
            self.add_source(source);
        }
        for id in current_ids {
            if !new_ids.contains(&id) {
                self.remove_source(&id);
            }
        }
    }

    /// Cancel a pending request position.
    ///
    /// `position_us < 0` removes every stub for `source_id` (bulk cancel;
    /// always takes precedence). Otherwise the position is localized the
    /// same way `enqueue` localizes it and the matching stub is removed —
    /// unless it is the current queue head, which is protected as in-flight
    /// work. Cancelling an absent position is a no-op.
    pub fn cancel(&self, source_path: &str, source_id: &str, position_us: i64) {
        let mut guard = self.lock();
        let shared = &mut *guard;

        if position_us < 0 {
            let cancelled = shared.queue.remove_for_source(source_id);
            Self::replan_head(shared);
            log::debug!("bulk cancel for {source_id}: removed {cancelled} stubs");
            return;
        }

        let head_is_active = shared.queue.head().is_some_and(|head| {
            head.request.source_id() == source_id
                && head.requested_us == position_us
                && position_us > 0
        });
        if head_is_active {
            return;
        }

        let Some(source) = shared
            .sources
            .iter()
            .find(|source| source.path() == source_path)
        else {
            return;
        };
        let duration_us = source.duration_us();
        let located_us = SingleRequest::new(source_path, source_id, position_us)
            .locate(duration_us)[0];
        if shared.queue.remove_located(source_id, located_us) {
            log::debug!("cancelled {source_id} at {position_us} (located {located_us})");
            Self::replan_head(shared);
        }
    }

    /// Head changes invalidate any earlier plan: force the owning segment to
    /// re-plan on its next cycle.
    fn replan_head(shared: &mut Shared) {
        if let Some(head) = shared.queue.head() {
            shared.segments.request_replan(head.request.source_id());
        }
    }

    /// Expand, bucket, and append `requests`, then drive the queue until it
    /// drains or the engine is cancelled.
    ///
    /// Requests targeting an unregistered source path are skipped with a
    /// warning. Returns [`KeysnapError::Cancelled`] when the drive was
    /// aborted; completed thumbnails up to that point were already
    /// published.
    pub fn enqueue(&self, requests: Vec<Arc<dyn ThumbnailRequest>>) -> Result<(), KeysnapError> {
        {
            let mut guard = self.lock();
            let shared = &mut *guard;

            // Group by source path, preserving first-seen order.
            let mut groups: Vec<(String, Vec<Arc<dyn ThumbnailRequest>>)> = Vec::new();
            for request in requests {
                let path = request.source_path().to_string();
                match groups.iter_mut().find(|(group_path, _)| *group_path == path) {
                    Some((_, group)) => group.push(request),
                    None => groups.push((path, vec![request])),
                }
            }

            for (path, group) in groups {
                let Some(source) = shared
                    .sources
                    .iter_mut()
                    .find(|source| source.path() == path)
                else {
                    log::warn!("no source registered for {path}, skipping its requests");
                    continue;
                };

                let duration_us = source.duration_us();
                let mut positions: Vec<(i64, Arc<dyn ThumbnailRequest>)> = group
                    .iter()
                    .flat_map(|request| {
                        request
                            .locate(duration_us)
                            .into_iter()
                            .map(|position_us| (position_us, Arc::clone(request)))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                positions.sort_by_key(|(position_us, _)| *position_us);

                let stubs: Vec<Stub> = positions
                    .into_iter()
                    .map(|(position_us, request)| Stub::new(request, position_us))
                    .collect();
                let bucketed = bucket_by_keyframe(stubs, source.as_mut());
                log::debug!(
                    "enqueued {} stubs for {path} ({} now pending)",
                    bucketed.len(),
                    shared.queue.len() + bucketed.len()
                );
                shared.queue.append(bucketed);
            }
        }

        self.drive()
    }

    /// The driving loop: `Idle → Draining → Completed`.
    fn drive(&self) -> Result<(), KeysnapError> {
        enum LoopAction {
            Done,
            Continue,
            Backoff,
        }

        loop {
            if self.cancellation.is_cancelled() {
                return Err(KeysnapError::Cancelled);
            }

            let action = {
                let mut guard = self.lock();
                let shared = &mut *guard;

                let next_target_us = shared.queue.next_target_us();
                let head = shared.queue.head().map(|head| {
                    (
                        head.request.source_path().to_string(),
                        FetchTarget {
                            localized_us: head.localized_us,
                            threshold_us: head.request.threshold_us(),
                        },
                    )
                });

                match head {
                    None => {
                        if !self.more_requests_expected() {
                            shared.segments.release_all();
                        }
                        LoopAction::Done
                    }
                    Some((head_path, fetch)) => match self
                        .advance_head(shared, &head_path, fetch, next_target_us)
                    {
                        Ok(AdvanceOutcome::Snapshot { pts_us, image }) => {
                            self.complete_head(shared, pts_us, image);
                            LoopAction::Continue
                        }
                        Ok(AdvanceOutcome::Progressed) => LoopAction::Continue,
                        Ok(AdvanceOutcome::Idle) => {
                            if Self::has_next(shared) {
                                LoopAction::Backoff
                            } else {
                                // Structurally exhausted with stubs left:
                                // terminate as if drained.
                                if !self.more_requests_expected() {
                                    shared.segments.release_all();
                                }
                                LoopAction::Done
                            }
                        }
                        Err(error) if error.is_fatal() => return Err(error),
                        Err(error) => {
                            log::debug!("advance failed ({error}), trying fallback extraction");
                            if self.cancellation.is_cancelled() {
                                return Err(KeysnapError::Cancelled);
                            }
                            if self.fallback_extract(shared) {
                                LoopAction::Continue
                            } else if Self::has_next(shared) {
                                LoopAction::Backoff
                            } else {
                                if !self.more_requests_expected() {
                                    shared.segments.release_all();
                                }
                                LoopAction::Done
                            }
                        }
                    }
                }
            };

            match action {
                LoopAction::Done => return Ok(()),
                LoopAction::Continue => {}
                LoopAction::Backoff => thread::sleep(self.options.backoff),
            }
        }
    }

    /// Advance the segment owning the head stub by one cycle.
    fn advance_head(
        &self,
        shared: &mut Shared,
        head_path: &str,
        fetch: FetchTarget,
        next_target_us: i64,
    ) -> Result<AdvanceOutcome, KeysnapError> {
        let Some(source) = shared
            .sources
            .iter_mut()
            .find(|source| source.path() == head_path)
        else {
            return Err(KeysnapError::Decode(format!(
                "no source registered for {head_path}"
            )));
        };

        let segment = shared
            .segments
            .activate(source.as_mut(), self.factory.as_ref(), &self.options.output)?;
        // A drained source retargets to the head itself: it is still the
        // position being fetched.
        segment.advance(source.as_mut(), Some(fetch), next_target_us)
    }

    /// Pop the head stub, record where the frame actually landed, and
    /// publish the thumbnail.
    fn complete_head(&self, shared: &mut Shared, pts_us: i64, image: image::DynamicImage) {
        let Some(mut stub) = shared.queue.pop_head() else {
            return;
        };
        stub.actual_localized_us = Some(pts_us);
        log::debug!(
            "got snapshot requested_us={} localized_us={} actual_us={pts_us}",
            stub.requested_us,
            stub.localized_us,
        );
        shared.segments.request_replan(stub.request.source_id());
        self.sender.publish(Thumbnail {
            request: Arc::clone(&stub.request),
            requested_us: stub.requested_us,
            image,
        });
    }

    /// Serve the head stub directly from the data source, bypassing the
    /// pipeline. Returns whether a thumbnail was produced.
    fn fallback_extract(&self, shared: &mut Shared) -> bool {
        let Some(head) = shared.queue.head() else {
            return false;
        };
        let head_path = head.request.source_path().to_string();
        let requested_us = head.requested_us;

        let Some(source) = shared
            .sources
            .iter_mut()
            .find(|source| source.path() == head_path)
        else {
            return false;
        };

        match source.frame_at(
            requested_us,
            self.options.fallback_width,
            self.options.fallback_height,
        ) {
            Some(image) => {
                if let Some(stub) = shared.queue.pop_head() {
                    log::debug!("fallback served {head_path} at {requested_us}");
                    shared.segments.request_replan(stub.request.source_id());
                    self.sender.publish(Thumbnail {
                        request: Arc::clone(&stub.request),
                        requested_us: stub.requested_us,
                        image,
                    });
                }
                true
            }
            None => {
                log::debug!("fallback miss for {head_path} at {requested_us}, will retry");
                false
            }
        }
    }

    /// Whether further structural progress remains possible across open
    /// segments.
    fn has_next(shared: &mut Shared) -> bool {
        let open_ids = shared.segments.open_ids();
        shared
            .sources
            .iter_mut()
            .filter(|source| open_ids.iter().any(|id| id == source.media_id()))
            .any(|source| !source.is_drained())
    }

    /// Subscribe to the ordered stream of completed thumbnails.
    ///
    /// Lazy: nothing is consumed until the stream is polled. Dropping the
    /// stream and subscribing again resumes from the next undelivered item.
    pub fn thumbnails(&self) -> ThumbnailStream {
        ThumbnailStream::new(Arc::clone(&self.receiver))
    }

    /// Number of stubs currently pending.
    pub fn pending_requests(&self) -> usize {
        self.lock().queue.len()
    }

    /// Tell the drive whether more `enqueue` calls are expected after the
    /// queue drains. When `true`, segments are kept open across drains.
    pub fn set_more_requests_expected(&self, expected: bool) {
        self.more_requests_expected
            .store(expected, Ordering::Release);
    }

    fn more_requests_expected(&self) -> bool {
        self.more_requests_expected.load(Ordering::Acquire)
    }

    /// The engine's cancellation token. Cancel it to abort an in-flight
    /// drive from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Terminal cleanup: drop all pending stubs, release every segment, and
    /// forget all sources. Idempotent.
    pub fn cleanup(&self) {
        let mut guard = self.lock();
        let shared = &mut *guard;
        shared.queue.clear();
        shared.segments.release_all();
        shared.sources.clear();
        log::debug!("engine cleaned up");
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
