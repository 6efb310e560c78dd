//! Live feed abstraction (mechanics only).
//!
//! A [`LiveFeed`] is the receiving end of a per-subscriber channel. Each subscriber
//! gets its own unbounded queue, so a publisher never waits on a slow consumer: the
//! writer hands the message off and moves on, and the consumer drains at its own pace.
//!
//! ## Unsubscribing
//!
//! Every feed carries an [`Unsubscribe`] handle. Dropping the feed (or calling
//! [`LiveFeed::unsubscribe`]) removes the subscriber from its publisher right away,
//! rather than waiting for the next publish attempt to notice a closed channel.
//!
//! ## Ordering
//!
//! Messages arrive in the order the publisher sent them. A feed can be preloaded
//! with a backlog before it is registered, which lets a publisher hand out history
//! and live messages through one gap-free queue.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Removes a subscriber from its publisher when dropped.
pub struct Unsubscribe {
    action: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(action: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { action: None }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

/// Receiving end of a live subscription.
#[derive(Debug)]
pub struct LiveFeed<M> {
    receiver: mpsc::UnboundedReceiver<M>,
    unsubscribe: Unsubscribe,
}

impl<M> LiveFeed<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>, unsubscribe: Unsubscribe) -> Self {
        Self {
            receiver,
            unsubscribe,
        }
    }

    /// Wait for the next message. `None` once the publisher closed the feed.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        self.receiver.try_recv().ok()
    }

    /// Detach from the publisher now. Queued messages are discarded.
    pub fn unsubscribe(self) {
        drop(self.unsubscribe);
    }
}

impl<M> Stream for LiveFeed<M> {
    type Item = M;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        self.receiver.poll_recv(cx)
    }
}
