//! End-to-end engine behavior over scripted sources and stages.

mod common;

use std::sync::Arc;

use common::{MockFactory, MockSource};
use keysnap::{EngineOptions, SingleRequest, ThumbnailEngine, ThumbnailRequest};
use tokio_stream::StreamExt;

fn request(position_us: i64) -> Arc<dyn ThumbnailRequest> {
    Arc::new(SingleRequest::new("clip", "clip", position_us).with_threshold_us(250_000))
}

fn clip() -> MockSource {
    // Keyframes every 2 s, frames every 500 ms, 6 s of video.
    MockSource::new("clip", &[0, 2_000_000, 4_000_000], 500_000, 6_000_000)
}

#[tokio::test]
async fn emits_thumbnails_in_bucketed_order() {
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(MockFactory::new()));
    let source = clip();
    let seeks = source.seek_log();
    engine.add_source(Box::new(source));

    let driver = engine.clone();
    tokio::task::spawn_blocking(move || {
        driver.enqueue(vec![request(3_100_000), request(900_000), request(2_500_000)])
    })
    .await
    .unwrap()
    .unwrap();

    // Positions are sorted and bucketed by preceding keyframe: 0.9 s first,
    // then 2.5 s and 3.1 s in one forward pass behind the 2 s keyframe.
    let mut thumbnails = engine.thumbnails();
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(thumbnails.next().await.unwrap().requested_us);
    }
    assert_eq!(order, vec![900_000, 2_500_000, 3_100_000]);

    // 0.9 s is reachable by linear decode from the start; the 2 s bucket
    // needs exactly one seek.
    assert_eq!(*seeks.lock().unwrap(), vec![2_000_000]);
    assert_eq!(engine.pending_requests(), 0);
}

#[tokio::test]
async fn consecutive_batches_rebuild_the_pipeline() {
    let factory = MockFactory::new();
    let created = Arc::clone(&factory.created);
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(factory));
    engine.add_source(Box::new(clip()));

    // Each drain tears the pipeline down; a later batch on the same source
    // must get a fresh one, not a degraded path.
    for position_us in [2_000_000, 4_000_000] {
        let driver = engine.clone();
        tokio::task::spawn_blocking(move || driver.enqueue(vec![request(position_us)]))
            .await
            .unwrap()
            .unwrap();
    }

    let mut thumbnails = engine.thumbnails();
    for expected_us in [2_000_000, 4_000_000] {
        let thumbnail = thumbnails.next().await.unwrap();
        assert_eq!(thumbnail.requested_us, expected_us);
        // Full pipeline output, not the fallback size.
        assert_eq!(thumbnail.image.width(), 1);
    }
    assert_eq!(created.load(std::sync::atomic::Ordering::Acquire), 2);
    assert_eq!(engine.pending_requests(), 0);
}

#[tokio::test]
async fn empty_batch_completes_without_building_a_pipeline() {
    let factory = MockFactory::new();
    let created = Arc::clone(&factory.created);
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(factory));
    engine.add_source(Box::new(clip()));

    let driver = engine.clone();
    tokio::task::spawn_blocking(move || driver.enqueue(Vec::new()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(created.load(std::sync::atomic::Ordering::Acquire), 0);
    assert_eq!(engine.pending_requests(), 0);
}

#[tokio::test]
async fn failing_pipeline_is_recovered_through_fallback_extraction() {
    let factory = MockFactory::failing(usize::MAX);
    let engine = ThumbnailEngine::with_factory(
        EngineOptions::new().with_fallback_dimensions(64, 64),
        Arc::new(factory),
    );
    engine.add_source(Box::new(clip().with_fallback_frames()));

    let driver = engine.clone();
    tokio::task::spawn_blocking(move || driver.enqueue(vec![request(1_000_000), request(3_000_000)]))
        .await
        .unwrap()
        .unwrap();

    let mut thumbnails = engine.thumbnails();
    for expected_us in [1_000_000, 3_000_000] {
        let thumbnail = thumbnails.next().await.unwrap();
        assert_eq!(thumbnail.requested_us, expected_us);
        assert_eq!(thumbnail.image.width(), 64);
    }
}

#[tokio::test]
async fn bulk_cancel_unblocks_a_parked_drive() {
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(MockFactory::idle()));
    engine.add_source(Box::new(MockSource::endless("clip", 6_000_000)));

    let driver = engine.clone();
    let drive = tokio::task::spawn_blocking(move || {
        driver.enqueue(vec![request(1_000_000), request(2_000_000)])
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(engine.pending_requests(), 2);

    engine.cancel("clip", "clip", -1);
    drive.await.unwrap().unwrap();
    assert_eq!(engine.pending_requests(), 0);
}

#[tokio::test]
async fn single_position_cancel_spares_other_stubs() {
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(MockFactory::idle()));
    engine.add_source(Box::new(MockSource::endless("clip", 6_000_000)));

    let driver = engine.clone();
    let drive = tokio::task::spawn_blocking(move || {
        driver.enqueue(vec![request(1_000_000), request(2_000_000)])
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The head (1 s) is in-flight and protected; 2 s can go.
    engine.cancel("clip", "clip", 1_000_000);
    assert_eq!(engine.pending_requests(), 2);
    engine.cancel("clip", "clip", 2_000_000);
    assert_eq!(engine.pending_requests(), 1);

    engine.cancellation_token().cancel();
    assert!(matches!(
        drive.await.unwrap(),
        Err(keysnap::KeysnapError::Cancelled)
    ));
}

#[tokio::test]
async fn removed_source_skips_its_requests_until_re_added() {
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(MockFactory::new()));
    engine.add_source(Box::new(clip()));
    engine.remove_source("clip");

    let driver = engine.clone();
    tokio::task::spawn_blocking(move || driver.enqueue(vec![request(2_000_000)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.pending_requests(), 0);

    // Re-adding reinstates the source and its segment slot.
    engine.add_source(Box::new(clip()));
    let driver = engine.clone();
    tokio::task::spawn_blocking(move || driver.enqueue(vec![request(2_000_000)]))
        .await
        .unwrap()
        .unwrap();

    let thumbnail = engine.thumbnails().next().await.unwrap();
    assert_eq!(thumbnail.requested_us, 2_000_000);
}

#[tokio::test]
async fn update_sources_reconciles_by_identity() {
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(MockFactory::new()));
    engine.add_source(Box::new(MockSource::new("a", &[0], 500_000, 2_000_000)));
    engine.add_source(Box::new(MockSource::new("b", &[0], 500_000, 2_000_000)));

    engine.update_sources(vec![
        Box::new(MockSource::new("b", &[0], 500_000, 2_000_000)),
        Box::new(MockSource::new("c", &[0], 500_000, 2_000_000)),
    ]);

    // "a" is gone, so its requests are skipped; "c" now resolves.
    let driver = engine.clone();
    tokio::task::spawn_blocking(move || {
        driver.enqueue(vec![
            Arc::new(SingleRequest::new("a", "a", 0)) as Arc<dyn ThumbnailRequest>,
            Arc::new(SingleRequest::new("c", "c", 0)) as Arc<dyn ThumbnailRequest>,
        ])
    })
    .await
    .unwrap()
    .unwrap();

    let thumbnail = engine.thumbnails().next().await.unwrap();
    assert_eq!(thumbnail.request.source_id(), "c");
}
