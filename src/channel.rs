//! The result channel.
//!
//! Completed thumbnails flow through a bounded `tokio::sync::mpsc` channel.
//! The producer side is best-effort and non-blocking: a full buffer drops
//! the new item (with a warning) instead of stalling the decode drive.
//! Consumers subscribe through [`ThumbnailStream`], a lazy ordered
//! [`Stream`](tokio_stream::Stream); dropping a stream and subscribing again
//! resumes from the next undelivered item.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::mpsc::{Receiver, Sender, channel, error::TrySendError};
use tokio_stream::Stream;

use crate::request::Thumbnail;

/// Best-effort producer handle.
#[derive(Clone)]
pub(crate) struct ResultSender {
    sender: Sender<Thumbnail>,
}

impl ResultSender {
    /// Publish a thumbnail without blocking.
    ///
    /// Returns `false` when the item was undeliverable (buffer full or all
    /// consumers gone).
    pub fn publish(&self, thumbnail: Thumbnail) -> bool {
        match self.sender.try_send(thumbnail) {
            Ok(()) => true,
            Err(TrySendError::Full(thumbnail)) => {
                log::warn!(
                    "result channel full, dropping thumbnail for {} at {}",
                    thumbnail.request.source_id(),
                    thumbnail.requested_us
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("result channel closed, thumbnail dropped");
                false
            }
        }
    }
}

/// Shared consumer endpoint; each [`ThumbnailStream`] polls through it.
pub(crate) type SharedReceiver = Arc<Mutex<Receiver<Thumbnail>>>;

/// Build the bounded result channel.
pub(crate) fn result_channel(capacity: usize) -> (ResultSender, SharedReceiver) {
    let (sender, receiver) = channel(capacity.max(1));
    (ResultSender { sender }, Arc::new(Mutex::new(receiver)))
}

/// An ordered, lazily consumed stream of completed [`Thumbnail`]s.
///
/// Obtained from [`ThumbnailEngine::thumbnails`](crate::ThumbnailEngine::thumbnails).
/// Multiple subscriptions share one underlying channel: items are delivered
/// to whichever stream polls first, in production order.
///
/// # Example
///
/// ```no_run
/// use tokio_stream::StreamExt;
///
/// # async fn example(engine: keysnap::ThumbnailEngine) {
/// let mut thumbnails = engine.thumbnails();
/// while let Some(thumbnail) = thumbnails.next().await {
///     println!("got {:?}", thumbnail);
/// }
/// # }
/// ```
pub struct ThumbnailStream {
    receiver: SharedReceiver,
}

impl ThumbnailStream {
    pub(crate) fn new(receiver: SharedReceiver) -> Self {
        Self { receiver }
    }
}

impl Stream for ThumbnailStream {
    type Item = Thumbnail;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Uncontended in practice: subscriptions are sequential consumers.
        let mut receiver = match self.receiver.lock() {
            Ok(receiver) => receiver,
            Err(poisoned) => poisoned.into_inner(),
        };
        receiver.poll_recv(cx)
    }
}
