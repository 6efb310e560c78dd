use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use streamfold_events::CancellationSignal;

use super::transport::SubscriptionTransport;
use super::{DeliveredEvent, SubscriptionError, SubscriptionKind, SubscriptionState};

pub(crate) type Delivery = Result<DeliveredEvent, SubscriptionError>;

/// Producer side of a subscription, handed to its transport.
#[derive(Clone)]
pub struct DeliverySink {
    deliveries: mpsc::Sender<Delivery>,
    state: Arc<watch::Sender<SubscriptionState>>,
    cancel: CancellationSignal,
}

impl DeliverySink {
    /// Hand one event to the consumer, waiting while its buffer is full.
    ///
    /// Fails with `Disposed` once the subscription was cancelled or dropped.
    pub async fn deliver(&self, event: DeliveredEvent) -> Result<(), SubscriptionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SubscriptionError::Disposed),
            sent = self.deliveries.send(Ok(event)) => sent.map_err(|_| SubscriptionError::Disposed),
        }
    }

    pub(crate) async fn fail(&self, err: SubscriptionError) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.deliveries.send(Err(err)) => {}
        }
    }

    /// Move to `state`; a disposed subscription stays disposed.
    pub fn set_state(&self, state: SubscriptionState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == SubscriptionState::Disposed {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Handle to a running subscription.
///
/// Events are pulled with [`Subscription::next`]. Disposing the handle (explicitly or
/// by dropping it) cancels the transport; [`Subscription::dispose`] additionally waits
/// until the transport released everything it held on the store side.
pub struct Subscription {
    id: Uuid,
    stream_id: String,
    kind: SubscriptionKind,
    transport: Arc<dyn SubscriptionTransport>,
    deliveries: mpsc::Receiver<Delivery>,
    state: watch::Receiver<SubscriptionState>,
    cancel: CancellationSignal,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Start `transport` in the background. Must be called inside a tokio runtime.
    pub fn open(
        stream_id: impl Into<String>,
        transport: Arc<dyn SubscriptionTransport>,
        buffer: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);
        let cancel = CancellationSignal::new();
        let sink = DeliverySink {
            deliveries: tx,
            state: Arc::new(state_tx),
            cancel: cancel.clone(),
        };

        let id = Uuid::now_v7();
        let stream_id = stream_id.into();
        let kind = transport.kind();
        let task = tokio::spawn(drive(id, Arc::clone(&transport), sink));
        debug!(subscription = %id, stream_id = %stream_id, ?kind, "subscription opened");

        Self {
            id,
            stream_id,
            kind,
            transport,
            deliveries: rx,
            state: state_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Wait until the subscription reaches `wanted` (or is disposed); returns the
    /// state it ended up in.
    pub async fn wait_for_state(&self, wanted: SubscriptionState) -> SubscriptionState {
        let mut state = self.state.clone();
        match state
            .wait_for(|s| *s == wanted || *s == SubscriptionState::Disposed)
            .await
        {
            Ok(s) => *s,
            Err(_) => SubscriptionState::Disposed,
        }
    }

    /// Next delivery. `None` once the subscription ended; a terminal failure is
    /// reported as one `Err` right before that.
    pub async fn next(&mut self) -> Option<Result<DeliveredEvent, SubscriptionError>> {
        self.deliveries.recv().await
    }

    /// Acknowledge the delivery at `offset` (durable subscriptions only).
    pub fn ack(&self, offset: u64) -> Result<(), SubscriptionError> {
        self.transport.acknowledge(offset)
    }

    pub fn ack_event(&self, event: &DeliveredEvent) -> Result<(), SubscriptionError> {
        self.ack(event.position())
    }

    /// Reject the delivery at `offset` so it is delivered again (durable only).
    pub fn nack(&self, offset: u64, reason: &str) -> Result<(), SubscriptionError> {
        self.transport.reject(offset, reason)
    }

    /// Stop delivery and wait until the transport has shut down.
    pub async fn dispose(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(subscription = %self.id, error = %err, "subscription task failed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

async fn drive(id: Uuid, transport: Arc<dyn SubscriptionTransport>, sink: DeliverySink) {
    let outcome = transport.start(sink.clone()).await;
    match outcome {
        Ok(()) => {}
        Err(_) if sink.is_cancelled() => {}
        Err(err) => {
            warn!(subscription = %id, error = %err, "subscription ended with an error");
            sink.fail(err).await;
        }
    }
    transport.stop().await;
    sink.set_state(SubscriptionState::Disposed);
    debug!(subscription = %id, "subscription disposed");
}
