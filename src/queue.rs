//! The pending-request queue and keyframe bucketer.
//!
//! The queue is a FIFO of [`Stub`]s — in-flight units of work. Production
//! order is strict FIFO (only the driving loop pops), but insertion order is
//! chosen by [`bucket_by_keyframe`]: stubs sharing a preceding keyframe are
//! grouped so one seek followed by forward linear decode serves the whole
//! bucket, avoiding redundant backward seeks.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use crate::planner::preceding_keyframe_us;
use crate::request::ThumbnailRequest;
use crate::source::FrameSource;

/// One in-flight unit of work.
///
/// `localized_us` is the working target (the bucketer may have adjusted it);
/// `actual_localized_us` is set once a frame is actually produced.
pub(crate) struct Stub {
    pub request: Arc<dyn ThumbnailRequest>,
    pub requested_us: i64,
    pub localized_us: i64,
    pub actual_localized_us: Option<i64>,
}

impl Stub {
    pub fn new(request: Arc<dyn ThumbnailRequest>, position_us: i64) -> Self {
        Self {
            request,
            requested_us: position_us,
            localized_us: position_us,
            actual_localized_us: None,
        }
    }
}

impl Debug for Stub {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "{}:{}",
            self.request.source_path(),
            self.requested_us
        )
    }
}

/// Ordered collection of pending stubs.
///
/// Single-writer: only the driving loop pops. External mutation (cancel,
/// bulk cancel) runs under the same engine mutex.
#[derive(Default)]
pub(crate) struct RequestQueue {
    stubs: VecDeque<Stub>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            stubs: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn head(&self) -> Option<&Stub> {
        self.stubs.front()
    }

    pub fn pop_head(&mut self) -> Option<Stub> {
        self.stubs.pop_front()
    }

    /// The head's working target, or `-1` when nothing is pending. A drained
    /// pipeline re-seeks here.
    pub fn next_target_us(&self) -> i64 {
        self.stubs.front().map_or(-1, |stub| stub.localized_us)
    }

    pub fn append(&mut self, stubs: Vec<Stub>) {
        self.stubs.extend(stubs);
    }

    /// Remove every stub for `source_id`. Returns how many were removed.
    pub fn remove_for_source(&mut self, source_id: &str) -> usize {
        let before = self.stubs.len();
        self.stubs
            .retain(|stub| stub.request.source_id() != source_id);
        before - self.stubs.len()
    }

    /// Remove the stub for `source_id` at the located target, if present.
    ///
    /// Idempotent: an absent stub is not an error.
    pub fn remove_located(&mut self, source_id: &str, localized_us: i64) -> bool {
        let position = self.stubs.iter().position(|stub| {
            stub.request.source_id() == source_id && stub.localized_us == localized_us
        });
        match position {
            Some(index) => {
                self.stubs.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.stubs.clear();
    }
}

/// Reorder freshly expanded stubs so that stubs sharing a preceding keyframe
/// are adjacent.
///
/// Buckets are keyed by each stub's preceding-keyframe timestamp and kept in
/// first-seen order; within a bucket, stubs are sorted by target timestamp.
/// May extend the source's keyframe index while computing bucket keys.
pub(crate) fn bucket_by_keyframe(stubs: Vec<Stub>, source: &mut dyn FrameSource) -> Vec<Stub> {
    let mut buckets: Vec<(i64, Vec<Stub>)> = Vec::new();
    for stub in stubs {
        let key = preceding_keyframe_us(source, stub.localized_us);
        match buckets.iter_mut().find(|(bucket_key, _)| *bucket_key == key) {
            Some((_, bucket)) => bucket.push(stub),
            None => buckets.push((key, vec![stub])),
        }
    }

    let mut ordered = Vec::new();
    for (_, mut bucket) in buckets {
        bucket.sort_by_key(|stub| stub.localized_us);
        ordered.append(&mut bucket);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::DynamicImage;

    use crate::source::SourceChunk;

    /// Minimal source exposing only a fixed keyframe index.
    struct IndexOnlySource {
        keyframes: Vec<i64>,
    }

    impl FrameSource for IndexOnlySource {
        fn media_id(&self) -> &str {
            "index-only"
        }

        fn path(&self) -> &str {
            "index-only"
        }

        fn duration_us(&self) -> i64 {
            self.keyframes.last().copied().unwrap_or(0)
        }

        fn keyframe_timestamps(&self) -> &[i64] {
            &self.keyframes
        }

        fn request_keyframe_timestamps(&mut self) -> Option<i64> {
            None
        }

        fn seek_to(&mut self, _position_us: i64) {}

        fn position_us(&self) -> i64 {
            0
        }

        fn is_drained(&mut self) -> bool {
            true
        }

        fn read_chunk(&mut self) -> Option<SourceChunk> {
            None
        }

        fn frame_at(&mut self, _: i64, _: u32, _: u32) -> Option<DynamicImage> {
            None
        }
    }

    fn stub(position_us: i64) -> Stub {
        Stub::new(
            Arc::new(crate::request::SingleRequest::new("p", "s", position_us)),
            position_us,
        )
    }

    #[test]
    fn buckets_keep_first_seen_order_and_sort_within() {
        let mut source = IndexOnlySource {
            keyframes: vec![0, 2_000_000, 4_000_000],
        };
        // 2.5s and 3.1s share the 2s keyframe; 0.9s maps to the 0s keyframe.
        let stubs = vec![stub(3_100_000), stub(900_000), stub(2_500_000)];
        let ordered = bucket_by_keyframe(stubs, &mut source);

        let positions: Vec<i64> = ordered.iter().map(|s| s.localized_us).collect();
        assert_eq!(positions, vec![2_500_000, 3_100_000, 900_000]);
    }

    #[test]
    fn remove_located_is_idempotent() {
        let mut queue = RequestQueue::new();
        queue.append(vec![stub(1_000), stub(2_000)]);

        assert!(queue.remove_located("s", 2_000));
        assert!(!queue.remove_located("s", 2_000));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_for_source_only_touches_matching_id() {
        let mut queue = RequestQueue::new();
        queue.append(vec![stub(1_000)]);
        queue.append(vec![Stub::new(
            Arc::new(crate::request::SingleRequest::new("q", "other", 5_000)),
            5_000,
        )]);

        assert_eq!(queue.remove_for_source("s"), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.head().unwrap().request.source_id(), "other");
    }
}
