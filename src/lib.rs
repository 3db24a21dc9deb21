//! # keysnap
//!
//! Keyframe-aware thumbnail extraction for video files.
//!
//! `keysnap` schedules batches of thumbnail requests against one or more
//! video sources and serves them through a single decode pipeline per
//! source, powered by FFmpeg via the
//! [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate. Requests are
//! reordered so positions sharing a preceding keyframe are decoded in one
//! forward pass, and a seek planner decides per request whether to seek at
//! all, to the next keyframe, or back to the previous one. Completed
//! thumbnails arrive as [`image::DynamicImage`] values on an async stream.
//!
//! ## Quick Start
//!
//! ### Extract Thumbnails at Fixed Positions
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keysnap::{EngineOptions, MediaSource, SingleRequest, ThumbnailEngine};
//!
//! let engine = ThumbnailEngine::new(EngineOptions::new().with_resolution(Some(320), None));
//! engine.add_source(Box::new(MediaSource::open("input.mp4").unwrap()));
//!
//! let request = SingleRequest::new("input.mp4", "input.mp4", 2_000_000)
//!     .with_threshold_us(500_000);
//! engine.enqueue(vec![Arc::new(request)]).unwrap();
//! ```
//!
//! ### Spread Thumbnails Across the Duration
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use keysnap::{EngineOptions, MediaSource, SpreadRequest, ThumbnailEngine};
//!
//! let engine = ThumbnailEngine::new(EngineOptions::new());
//! engine.add_source(Box::new(MediaSource::open("input.mp4").unwrap()));
//! engine.enqueue(vec![Arc::new(SpreadRequest::new("input.mp4", "input.mp4", 8))]).unwrap();
//! ```
//!
//! ### Consume the Result Stream
//!
//! ```no_run
//! use tokio_stream::StreamExt;
//!
//! # async fn example(engine: keysnap::ThumbnailEngine) {
//! let mut thumbnails = engine.thumbnails();
//! while let Some(thumbnail) = thumbnails.next().await {
//!     println!("thumbnail at {} us", thumbnail.requested_us);
//! }
//! # }
//! ```
//!
//! ## Features
//!
//! - **Keyframe-aware scheduling** — requests are bucketed by preceding
//!   keyframe so one seek serves a whole group
//! - **Tolerance-driven seek planning** — positions close enough to the next
//!   keyframe seek forward instead of decoding a full group of pictures
//! - **Ordered result stream** — a lazy, bounded async stream of completed
//!   thumbnails
//! - **Multiple sources** — add, remove, and reconcile sources against one
//!   shared queue
//! - **Cancellation** — per-position, per-source bulk, and whole-engine via
//!   `CancellationToken`
//! - **Fallback extraction** — transient pipeline failures are recovered
//!   through a direct single-frame decode
//! - **Pluggable pipeline** — swap the FFmpeg decode stage for your own via
//!   [`PipelineFactory`]
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system.

pub mod cancel;
pub mod channel;
pub mod engine;
pub mod error;
pub mod media;
pub mod options;
pub mod planner;
mod queue;
pub mod request;
pub mod segment;
pub mod source;

pub use cancel::CancellationToken;
pub use channel::ThumbnailStream;
pub use engine::ThumbnailEngine;
pub use error::KeysnapError;
pub use media::{MediaPipeline, MediaPipelineFactory, MediaSource};
pub use options::{EngineOptions, FrameOutputOptions};
pub use planner::{SeekDecision, SeekState, plan_seek};
pub use request::{SingleRequest, SpreadRequest, Thumbnail, ThumbnailRequest};
pub use segment::{DecoderStage, PipelineFactory, PipelineStep};
pub use source::{FrameSource, RetargetOnEos, SourceChunk};
