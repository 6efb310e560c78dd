//! In-memory fan-out for live feeds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::bus::{LiveFeed, Unsubscribe};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FanOutError {
    /// Publish failed due to internal lock poisoning.
    #[error("fan-out subscriber registry poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Subscribers<M> {
    next_id: u64,
    senders: BTreeMap<u64, mpsc::UnboundedSender<M>>,
}

/// Broadcasts messages to every registered [`LiveFeed`].
///
/// - Non-blocking publish (unbounded per-subscriber queues)
/// - Dead subscribers are dropped while publishing
/// - Dropping a feed unregisters it immediately
#[derive(Debug)]
pub struct FanOut<M> {
    subscribers: Arc<Mutex<Subscribers<M>>>,
}

impl<M> Clone for FanOut<M> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<M> Default for FanOut<M> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: BTreeMap::new(),
            })),
        }
    }
}

impl<M> FanOut<M>
where
    M: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Result<LiveFeed<M>, FanOutError> {
        self.subscribe_with(std::iter::empty())
    }

    /// Register a feed whose queue already holds `backlog`.
    ///
    /// The backlog is queued before the feed becomes visible to publishers, so a
    /// caller that serializes this with `publish` gets history and live messages in
    /// one ordered queue.
    pub fn subscribe_with(
        &self,
        backlog: impl IntoIterator<Item = M>,
    ) -> Result<LiveFeed<M>, FanOutError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for message in backlog {
            // The receiver is alive in this scope, so this cannot fail.
            let _ = tx.send(message);
        }

        let mut subs = self.subscribers.lock().map_err(|_| FanOutError::Poisoned)?;
        let id = subs.next_id;
        subs.next_id += 1;
        subs.senders.insert(id, tx);
        drop(subs);

        let registry = Arc::downgrade(&self.subscribers);
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(registry) = registry.upgrade() {
                if let Ok(mut subs) = registry.lock() {
                    subs.senders.remove(&id);
                }
            }
        });

        Ok(LiveFeed::new(rx, unsubscribe))
    }

    /// Send `message` to every live subscriber. Returns how many received it.
    pub fn publish(&self, message: M) -> Result<usize, FanOutError> {
        let mut subs = self.subscribers.lock().map_err(|_| FanOutError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.senders.retain(|_, tx| tx.send(message.clone()).is_ok());

        Ok(subs.senders.len())
    }

    /// Send a final message to every subscriber and disconnect them all.
    pub fn close_with(&self, message: M) -> Result<(), FanOutError> {
        let mut subs = self.subscribers.lock().map_err(|_| FanOutError::Poisoned)?;
        for (_, tx) in std::mem::take(&mut subs.senders) {
            let _ = tx.send(message.clone());
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.senders.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_to_every_subscriber_in_order() {
        let fanout = FanOut::new();
        let mut a = fanout.subscribe().unwrap();
        let mut b = fanout.subscribe().unwrap();

        assert_eq!(fanout.publish(1).unwrap(), 2);
        assert_eq!(fanout.publish(2).unwrap(), 2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn backlog_precedes_live_messages() {
        let fanout = FanOut::new();
        let mut feed = fanout.subscribe_with(vec![1, 2]).unwrap();
        fanout.publish(3).unwrap();

        assert_eq!(feed.recv().await, Some(1));
        assert_eq!(feed.recv().await, Some(2));
        assert_eq!(feed.recv().await, Some(3));
    }

    #[test]
    fn dropping_a_feed_unregisters_it_immediately() {
        let fanout = FanOut::<u32>::new();
        let feed = fanout.subscribe().unwrap();
        let other = fanout.subscribe().unwrap();
        assert_eq!(fanout.subscriber_count(), 2);

        drop(feed);
        assert_eq!(fanout.subscriber_count(), 1);

        other.unsubscribe();
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_with_ends_every_feed() {
        let fanout = FanOut::new();
        let mut feed = fanout.subscribe().unwrap();
        fanout.close_with("gone").unwrap();

        assert_eq!(feed.recv().await, Some("gone"));
        assert_eq!(feed.recv().await, None);
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
