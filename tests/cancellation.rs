//! Cancellation token semantics and drive abortion.

mod common;

use std::sync::Arc;

use common::{MockFactory, MockSource};
use keysnap::{
    CancellationToken, EngineOptions, KeysnapError, SingleRequest, ThumbnailEngine,
    ThumbnailRequest,
};

fn request(position_us: i64) -> Arc<dyn ThumbnailRequest> {
    Arc::new(SingleRequest::new("clip", "clip", position_us).with_threshold_us(250_000))
}

#[test]
fn token_starts_clear_and_latches_on_cancel() {
    let token = CancellationToken::new();
    assert!(!token.is_cancelled());

    token.cancel();
    assert!(token.is_cancelled());
    // Cancelling twice is fine.
    token.cancel();
    assert!(token.is_cancelled());
}

#[test]
fn clones_share_the_cancelled_state() {
    let token = CancellationToken::new();
    let clone = token.clone();

    clone.cancel();
    assert!(token.is_cancelled());
}

#[test]
fn pre_cancelled_token_aborts_the_drive_immediately() {
    let token = CancellationToken::new();
    token.cancel();

    let engine = ThumbnailEngine::with_factory(
        EngineOptions::new().with_cancellation(token),
        Arc::new(MockFactory::new()),
    );
    engine.add_source(Box::new(MockSource::new("clip", &[0], 500_000, 2_000_000)));

    let result = engine.enqueue(vec![request(1_000_000)]);
    assert!(matches!(result, Err(KeysnapError::Cancelled)));
}

#[tokio::test]
async fn cancelling_mid_drive_keeps_stubs_until_cleanup() {
    let engine = ThumbnailEngine::with_factory(EngineOptions::new(), Arc::new(MockFactory::idle()));
    engine.add_source(Box::new(MockSource::endless("clip", 6_000_000)));

    let driver = engine.clone();
    let drive = tokio::task::spawn_blocking(move || {
        driver.enqueue(vec![request(1_000_000), request(2_000_000)])
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    engine.cancellation_token().cancel();

    assert!(matches!(
        drive.await.unwrap(),
        Err(KeysnapError::Cancelled)
    ));
    // Cancellation abandons the drive, not the queue.
    assert_eq!(engine.pending_requests(), 2);

    engine.cleanup();
    assert_eq!(engine.pending_requests(), 0);
    // Idempotent.
    engine.cleanup();
}
