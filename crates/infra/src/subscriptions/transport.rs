//! Delivery strategies behind a [`Subscription`](super::Subscription).

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::debug;

use streamfold_core::{StreamPosition, StreamReadDirection};

use crate::event_store::{EventStore, RecordFeed};

use super::subscription::DeliverySink;
use super::{DeliveredEvent, SubscriptionError, SubscriptionKind, SubscriptionState};

/// A pluggable delivery strategy.
///
/// `start` runs for the whole life of the subscription: it pushes events into the
/// sink until the source ends, fails, or the sink is cancelled. Returning `Err`
/// surfaces the error to the consumer as the final delivery. `stop` runs once after
/// `start` returned and releases whatever the transport still holds.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync + 'static {
    fn kind(&self) -> SubscriptionKind;

    async fn start(&self, sink: DeliverySink) -> Result<(), SubscriptionError>;

    async fn stop(&self) {}

    fn acknowledge(&self, _offset: u64) -> Result<(), SubscriptionError> {
        Err(SubscriptionError::NotAcknowledgeable)
    }

    fn reject(&self, _offset: u64, _reason: &str) -> Result<(), SubscriptionError> {
        Err(SubscriptionError::NotAcknowledgeable)
    }
}

/// Forward live records into the sink.
///
/// Records at or below `last_delivered`, or below `floor`, are dropped: they were
/// already delivered by the replay scan or precede the requested start.
async fn pump_live(
    mut feed: RecordFeed,
    sink: &DeliverySink,
    mut last_delivered: Option<u64>,
    floor: u64,
) -> Result<(), SubscriptionError> {
    loop {
        let item = tokio::select! {
            biased;
            _ = sink.cancelled() => return Ok(()),
            item = feed.recv() => item,
        };
        match item {
            None => return Ok(()),
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(record)) => {
                if record.offset < floor || last_delivered.is_some_and(|last| record.offset <= last) {
                    debug!(offset = record.offset, "skipping record already delivered");
                    continue;
                }
                last_delivered = Some(record.offset);
                sink.deliver(DeliveredEvent::new(record)).await?;
            }
        }
    }
}

/// Ephemeral, live-only delivery.
#[derive(Debug, Clone)]
pub struct StandardTransport<S> {
    store: S,
    stream_id: String,
}

impl<S> StandardTransport<S> {
    pub fn new(store: S, stream_id: impl Into<String>) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl<S> SubscriptionTransport for StandardTransport<S>
where
    S: EventStore + 'static,
{
    fn kind(&self) -> SubscriptionKind {
        SubscriptionKind::Standard
    }

    async fn start(&self, sink: DeliverySink) -> Result<(), SubscriptionError> {
        let feed = self
            .store
            .subscribe(&self.stream_id, StreamPosition::EndOfStream)
            .await?;
        sink.set_state(SubscriptionState::Live);
        pump_live(feed, &sink, None, 0).await
    }
}

/// Replay-then-live delivery.
///
/// The live feed is opened *before* the history scan, so records appended while the
/// scan runs queue up in it. After the scan the queue is drained, dropping every
/// record the scan already delivered, and delivery continues live. Scan and live
/// delivery run one after the other in the same task, never concurrently.
#[derive(Debug, Clone)]
pub struct CatchUpTransport<S> {
    store: S,
    stream_id: String,
    from: StreamPosition,
}

impl<S> CatchUpTransport<S> {
    pub fn new(store: S, stream_id: impl Into<String>, from: StreamPosition) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
            from,
        }
    }
}

#[async_trait]
impl<S> SubscriptionTransport for CatchUpTransport<S>
where
    S: EventStore + 'static,
{
    fn kind(&self) -> SubscriptionKind {
        SubscriptionKind::CatchUp
    }

    async fn start(&self, sink: DeliverySink) -> Result<(), SubscriptionError> {
        let StreamPosition::Offset(floor) = self.from else {
            let feed = self
                .store
                .subscribe(&self.stream_id, StreamPosition::EndOfStream)
                .await?;
            sink.set_state(SubscriptionState::Live);
            return pump_live(feed, &sink, None, 0).await;
        };

        sink.set_state(SubscriptionState::Replaying);
        let live = self
            .store
            .subscribe(&self.stream_id, StreamPosition::EndOfStream)
            .await?;
        let mut history = self
            .store
            .read(
                &self.stream_id,
                StreamReadDirection::Forwards,
                StreamPosition::Offset(floor),
                None,
            )
            .await?;

        let mut last_delivered = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.cancelled() => return Ok(()),
                next = history.next() => next,
            };
            let Some(record) = next else { break };
            let record = record?;
            last_delivered = Some(record.offset);
            sink.deliver(DeliveredEvent::new(record)).await?;
        }

        debug!(stream_id = %self.stream_id, ?last_delivered, "caught up, switching to live");
        sink.set_state(SubscriptionState::Live);
        pump_live(live, &sink, last_delivered, floor).await
    }
}
