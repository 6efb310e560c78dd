//! Durable subscription groups.
//!
//! A group is an actor task that exclusively owns the group's delivery state: the
//! feed it reads from, which consumer holds which event, what was acknowledged and
//! what was checkpointed. Consumers talk to it through an unbounded command channel
//! (join, leave, ack, nack), so acknowledging never waits on the actor.
//!
//! ## Delivery
//!
//! Events are read through a catch-up feed starting after the last checkpoint and
//! handed out round-robin to consumers that have capacity (one unacknowledged event
//! per consumer with [`EventAckMode::PerEvent`], a batch with
//! [`EventAckMode::Batched`]). Rejected events, and events held by a consumer that
//! left, go back to the front of the queue and are delivered again.
//!
//! ## Checkpoints
//!
//! The checkpoint is the highest offset with every event at or below it
//! acknowledged. It is written once at least `min_events_before_checkpoint` new
//! events are covered (on the `checkpoint_after` tick), immediately once
//! `max_events_before_checkpoint` are covered, and whenever the last consumer leaves
//! or the group shuts down.
//!
//! ## Reconnecting
//!
//! A transport failure on the feed moves the group to `Reconnecting`. After an
//! exponential backoff the feed is reopened right after the last event read, while
//! unacknowledged events stay queued, so nothing is skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use streamfold_core::{EventRecord, StreamPosition, StreamReadDirection};

use crate::event_store::{EventStore, EventStoreError};

use super::checkpoint_store::CheckpointStore;
use super::subscription::{Delivery, DeliverySink, Subscription};
use super::transport::{CatchUpTransport, SubscriptionTransport};
use super::{
    DeliveredEvent, DurableSubscriptionOptions, EventAckMode, SubscriptionError, SubscriptionKind,
    SubscriptionState,
};

/// Buffer between the group's feed and the group actor.
const FEED_BUFFER: usize = 64;

#[derive(Debug)]
enum GroupCommand {
    Join {
        reply: oneshot::Sender<Result<ConsumerLease, SubscriptionError>>,
    },
    Leave {
        consumer: u64,
    },
    Ack {
        consumer: u64,
        offset: u64,
    },
    Nack {
        consumer: u64,
        offset: u64,
        reason: String,
    },
    Shutdown,
}

/// A consumer's membership in a group.
#[derive(Debug)]
pub(crate) struct ConsumerLease {
    id: u64,
    deliveries: mpsc::Receiver<Delivery>,
    state: watch::Receiver<SubscriptionState>,
}

/// Why a join did not produce a lease.
#[derive(Debug)]
pub(crate) enum JoinError {
    /// The group actor is gone; a new one can be started.
    GroupStopped,
    Rejected(SubscriptionError),
}

/// Cheap, cloneable handle to a running group actor.
#[derive(Debug, Clone)]
pub(crate) struct GroupClient {
    commands: mpsc::UnboundedSender<GroupCommand>,
}

impl GroupClient {
    pub(crate) async fn join(&self) -> Result<ConsumerLease, JoinError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(GroupCommand::Join { reply })
            .map_err(|_| JoinError::GroupStopped)?;
        match response.await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(err)) => Err(JoinError::Rejected(err)),
            Err(_) => Err(JoinError::GroupStopped),
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(GroupCommand::Shutdown);
    }

    fn send(&self, command: GroupCommand) -> Result<(), SubscriptionError> {
        self.commands
            .send(command)
            .map_err(|_| SubscriptionError::Disposed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Start a group actor for `(options.durable_name, stream_id)`.
pub(crate) fn spawn_group<S>(
    store: S,
    checkpoints: Arc<dyn CheckpointStore>,
    stream_id: String,
    options: DurableSubscriptionOptions,
) -> (GroupClient, JoinHandle<()>)
where
    S: EventStore + Clone + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (state, _) = watch::channel(SubscriptionState::Created);
    let group = DurableGroup {
        store,
        checkpoints,
        stream_id,
        options,
        consumers: Vec::new(),
        next_consumer_id: 0,
        round_robin: 0,
        outstanding: BTreeMap::new(),
        queued: BTreeSet::new(),
        high_water: None,
        persisted: None,
        feed: None,
        feed_state: None,
        state,
        reconnect_attempt: 0,
        reconnect_at: None,
    };
    let task = tokio::spawn(group.run(rx));
    (GroupClient { commands: tx }, task)
}

#[derive(Debug)]
struct Consumer {
    id: u64,
    sender: mpsc::Sender<Delivery>,
    in_flight: BTreeSet<u64>,
}

#[derive(Debug)]
struct Outstanding {
    delivered: DeliveredEvent,
    owner: Option<u64>,
}

struct DurableGroup<S> {
    store: S,
    checkpoints: Arc<dyn CheckpointStore>,
    stream_id: String,
    options: DurableSubscriptionOptions,

    consumers: Vec<Consumer>,
    next_consumer_id: u64,
    round_robin: usize,

    /// Read from the feed but not acknowledged yet, keyed by position.
    outstanding: BTreeMap<u64, Outstanding>,
    /// Outstanding positions waiting for a consumer.
    queued: BTreeSet<u64>,
    /// Last position read from the feed.
    high_water: Option<u64>,
    /// Last checkpoint written.
    persisted: Option<u64>,

    feed: Option<Subscription>,
    feed_state: Option<watch::Receiver<SubscriptionState>>,
    state: watch::Sender<SubscriptionState>,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
}

async fn next_delivery(feed: &mut Option<Subscription>) -> Option<Delivery> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

async fn next_state(state: &mut Option<watch::Receiver<SubscriptionState>>) -> Option<SubscriptionState> {
    match state {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl<S> DurableGroup<S>
where
    S: EventStore + Clone + 'static,
{
    fn name(&self) -> &str {
        &self.options.durable_name
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<GroupCommand>) {
        match self.checkpoints.load(self.name(), &self.stream_id).await {
            Ok(checkpoint) => self.persisted = checkpoint,
            Err(err) => {
                warn!(group = %self.name(), error = %err, "failed to load checkpoint");
                self.fail(err.into());
                return;
            }
        }
        info!(group = %self.name(), stream_id = %self.stream_id, checkpoint = ?self.persisted, "durable group started");

        let mut tick = tokio::time::interval(self.options.checkpoint_after);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let can_pull = self.feed.is_some() && self.queued.is_empty() && self.has_capacity();
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    None | Some(GroupCommand::Shutdown) => break,
                    Some(command) => {
                        if !self.handle(command).await {
                            return;
                        }
                    }
                },
                item = next_delivery(&mut self.feed), if can_pull => {
                    if !self.on_feed_item(item).await {
                        return;
                    }
                },
                state = next_state(&mut self.feed_state), if self.feed_state.is_some() => match state {
                    Some(SubscriptionState::Live) => self.set_state(SubscriptionState::Live),
                    Some(_) => {}
                    None => self.feed_state = None,
                },
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect();
                },
                _ = tick.tick() => self.checkpoint(false).await,
            }
        }

        self.checkpoint(true).await;
        self.close_feed();
        self.set_state(SubscriptionState::Disposed);
        info!(group = %self.name(), stream_id = %self.stream_id, "durable group stopped");
    }

    /// Returns `false` when the group failed and must stop.
    async fn handle(&mut self, command: GroupCommand) -> bool {
        match command {
            GroupCommand::Join { reply } => {
                let lease = self.join();
                let joined = lease.is_ok();
                if reply.send(lease).is_err() {
                    debug!(group = %self.name(), "joining consumer went away");
                }
                if joined {
                    if self.feed.is_none() && self.reconnect_at.is_none() {
                        self.open_feed();
                    }
                    self.dispatch();
                }
            }
            GroupCommand::Leave { consumer } => {
                self.remove_consumer(consumer);
                if self.consumers.is_empty() {
                    self.checkpoint(true).await;
                    self.close_feed();
                }
            }
            GroupCommand::Ack { consumer, offset } => {
                self.acknowledge(consumer, offset);
                if self.unpersisted() >= self.options.max_events_before_checkpoint {
                    self.checkpoint(false).await;
                }
            }
            GroupCommand::Nack {
                consumer,
                offset,
                reason,
            } => self.reject(consumer, offset, &reason),
            GroupCommand::Shutdown => {}
        }
        true
    }

    fn join(&mut self) -> Result<ConsumerLease, SubscriptionError> {
        if self.consumers.len() >= self.options.max_subscribers {
            return Err(SubscriptionError::MaxSubscribersReached {
                name: self.name().to_string(),
                max: self.options.max_subscribers,
            });
        }

        let id = self.next_consumer_id;
        self.next_consumer_id += 1;
        let (sender, deliveries) = mpsc::channel(self.options.in_flight_per_consumer() + 1);
        self.consumers.push(Consumer {
            id,
            sender,
            in_flight: BTreeSet::new(),
        });
        debug!(group = %self.name(), consumer = id, consumers = self.consumers.len(), "consumer joined");

        Ok(ConsumerLease {
            id,
            deliveries,
            state: self.state.subscribe(),
        })
    }

    fn remove_consumer(&mut self, consumer: u64) {
        let Some(idx) = self.consumers.iter().position(|c| c.id == consumer) else {
            return;
        };
        let removed = self.consumers.remove(idx);
        for position in removed.in_flight {
            self.requeue(position);
        }
        debug!(group = %self.name(), consumer, consumers = self.consumers.len(), "consumer left");
        self.dispatch();
    }

    fn requeue(&mut self, position: u64) {
        if let Some(entry) = self.outstanding.get_mut(&position) {
            entry.owner = None;
            entry.delivered.retry_count += 1;
            self.queued.insert(position);
        }
    }

    fn has_capacity(&self) -> bool {
        let cap = self.options.in_flight_per_consumer();
        self.consumers.iter().any(|c| c.in_flight.len() < cap)
    }

    fn next_consumer(&mut self) -> Option<usize> {
        let cap = self.options.in_flight_per_consumer();
        let count = self.consumers.len();
        for step in 0..count {
            let idx = (self.round_robin + step) % count;
            if self.consumers[idx].in_flight.len() < cap {
                self.round_robin = (idx + 1) % count;
                return Some(idx);
            }
        }
        None
    }

    /// Hand queued events to consumers with capacity, in position order.
    fn dispatch(&mut self) {
        while let Some(&position) = self.queued.first() {
            let Some(idx) = self.next_consumer() else { break };
            let Some(entry) = self.outstanding.get_mut(&position) else {
                self.queued.remove(&position);
                continue;
            };

            let consumer = &mut self.consumers[idx];
            match consumer.sender.try_send(Ok(entry.delivered.clone())) {
                Ok(()) => {
                    entry.owner = Some(consumer.id);
                    consumer.in_flight.insert(position);
                    self.queued.remove(&position);
                }
                Err(_) => {
                    // The consumer is gone (or wedged); hand its events to the others.
                    let id = consumer.id;
                    self.remove_consumer(id);
                }
            }
        }
    }

    fn acknowledge(&mut self, consumer: u64, offset: u64) {
        let mode = self.options.ack_mode;
        let Some(c) = self.consumers.iter_mut().find(|c| c.id == consumer) else {
            return;
        };
        let acked: Vec<u64> = match mode {
            EventAckMode::PerEvent => c.in_flight.take(&offset).into_iter().collect(),
            EventAckMode::Batched => c.in_flight.range(..=offset).copied().collect(),
        };
        if acked.is_empty() {
            debug!(group = %self.options.durable_name, consumer, offset, "ignoring ack for an event not held by the consumer");
            return;
        }
        for position in &acked {
            c.in_flight.remove(position);
            self.outstanding.remove(position);
        }
        self.dispatch();
    }

    fn reject(&mut self, consumer: u64, offset: u64, reason: &str) {
        let Some(c) = self.consumers.iter_mut().find(|c| c.id == consumer) else {
            return;
        };
        if !c.in_flight.remove(&offset) {
            return;
        }
        debug!(group = %self.options.durable_name, consumer, offset, reason, "event rejected, redelivering");
        self.requeue(offset);
        self.dispatch();
    }

    /// Highest position with everything at or below it acknowledged.
    fn ack_floor(&self) -> Option<u64> {
        match self.outstanding.keys().next() {
            Some(&first) => first.checked_sub(1),
            None => self.high_water,
        }
    }

    /// Acknowledged events not covered by the persisted checkpoint yet.
    fn unpersisted(&self) -> u64 {
        let covered = self.ack_floor().map_or(0, |c| c + 1);
        let persisted = self.persisted.map_or(0, |p| p + 1);
        covered.saturating_sub(persisted)
    }

    async fn checkpoint(&mut self, force: bool) {
        let pending = self.unpersisted();
        if pending == 0 || (!force && pending < self.options.min_events_before_checkpoint) {
            return;
        }
        let Some(checkpoint) = self.ack_floor() else { return };
        match self
            .checkpoints
            .save(&self.options.durable_name, &self.stream_id, checkpoint)
            .await
        {
            Ok(()) => {
                self.persisted = Some(checkpoint);
                debug!(group = %self.name(), checkpoint, "checkpoint written");
            }
            Err(err) => warn!(group = %self.name(), error = %err, "failed to write checkpoint"),
        }
    }

    fn resume_position(&self) -> StreamPosition {
        match self.high_water.or(self.persisted) {
            Some(last) => StreamPosition::Offset(last + 1),
            None => self.options.start_from,
        }
    }

    fn open_feed(&mut self) {
        let from = self.resume_position();
        let transport = CatchUpTransport::new(self.store.clone(), self.stream_id.clone(), from);
        let feed = Subscription::open(self.stream_id.clone(), Arc::new(transport), FEED_BUFFER);
        debug!(group = %self.name(), %from, "feed opened");
        self.feed_state = Some(feed.state_changes());
        self.feed = Some(feed);
        // A reconnecting group reports Live again once the new feed is live.
        if *self.state.borrow() != SubscriptionState::Reconnecting {
            self.set_state(SubscriptionState::Replaying);
        }
    }

    fn close_feed(&mut self) {
        self.feed = None;
        self.feed_state = None;
    }

    /// Returns `false` when the group failed and must stop.
    async fn on_feed_item(&mut self, item: Option<Delivery>) -> bool {
        match item {
            Some(Ok(delivered)) => {
                self.reconnect_attempt = 0;
                let position = delivered.position();
                if self.high_water.is_some_and(|h| position <= h) {
                    return true;
                }
                let delivered = match self.resolve(delivered).await {
                    Ok(delivered) => delivered,
                    Err(err) if err.is_transient() => return self.begin_reconnect(err),
                    Err(err) => {
                        self.fail(err);
                        return false;
                    }
                };
                self.high_water = Some(position);
                self.outstanding.insert(
                    position,
                    Outstanding {
                        delivered,
                        owner: None,
                    },
                );
                self.queued.insert(position);
                self.dispatch();
                true
            }
            Some(Err(err)) if err.is_transient() => self.begin_reconnect(err),
            Some(Err(err)) => {
                self.fail(err);
                false
            }
            None => self.begin_reconnect(SubscriptionError::Disposed),
        }
    }

    /// Replace a link event by the event it points at, when the group resolves links.
    ///
    /// A link whose target no longer exists is delivered as the link itself.
    async fn resolve(&self, delivered: DeliveredEvent) -> Result<DeliveredEvent, SubscriptionError> {
        if !self.options.resolve_links {
            return Ok(delivered);
        }
        let Some(target) = delivered.event.link_target() else {
            return Ok(delivered);
        };

        let found = match self
            .store
            .read(
                &target.stream_id,
                StreamReadDirection::Forwards,
                StreamPosition::Offset(target.offset),
                Some(1),
            )
            .await
        {
            Ok(mut records) => records.next().await.transpose()?,
            Err(EventStoreError::StreamNotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        match found {
            Some(record) if record.offset == target.offset => {
                Ok(DeliveredEvent::linked(record, delivered.event))
            }
            _ => {
                warn!(group = %self.name(), link = %target, "link target is gone, delivering the link");
                Ok(delivered)
            }
        }
    }

    /// Returns `false` when the group gave up and must stop.
    fn begin_reconnect(&mut self, cause: SubscriptionError) -> bool {
        self.close_feed();
        self.reconnect_attempt += 1;
        if !self.options.retry.allows(self.reconnect_attempt) {
            self.fail(SubscriptionError::RetriesExhausted {
                attempts: self.reconnect_attempt - 1,
            });
            return false;
        }
        let delay = self.options.retry.backoff(self.reconnect_attempt);
        warn!(
            group = %self.name(),
            error = %cause,
            attempt = self.reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            "feed lost, reconnecting"
        );
        self.set_state(SubscriptionState::Reconnecting);
        self.reconnect_at = Some(Instant::now() + delay);
        true
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        if self.consumers.is_empty() {
            return;
        }
        self.open_feed();
    }

    /// Report `err` to every consumer and stop serving them.
    fn fail(&mut self, err: SubscriptionError) {
        warn!(group = %self.name(), error = %err, "durable group failed");
        for consumer in self.consumers.drain(..) {
            let _ = consumer.sender.try_send(Err(err.clone()));
        }
        self.close_feed();
        self.set_state(SubscriptionState::Disposed);
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

/// Consumer side of a durable group: forwards the lease's deliveries into the
/// subscription and routes acknowledgements back to the group.
pub(crate) struct DurableTransport {
    client: GroupClient,
    consumer: u64,
    lease: Mutex<Option<ConsumerLease>>,
    left: AtomicBool,
}

impl DurableTransport {
    pub(crate) fn new(client: GroupClient, lease: ConsumerLease) -> Self {
        Self {
            client,
            consumer: lease.id,
            lease: Mutex::new(Some(lease)),
            left: AtomicBool::new(false),
        }
    }

    fn leave(&self) {
        if !self.left.swap(true, Ordering::AcqRel) {
            let _ = self.client.send(GroupCommand::Leave {
                consumer: self.consumer,
            });
        }
    }
}

#[async_trait]
impl SubscriptionTransport for DurableTransport {
    fn kind(&self) -> SubscriptionKind {
        SubscriptionKind::Durable
    }

    async fn start(&self, sink: DeliverySink) -> Result<(), SubscriptionError> {
        let lease = self
            .lease
            .lock()
            .map_err(|_| SubscriptionError::Disposed)?
            .take();
        let Some(ConsumerLease {
            mut deliveries,
            mut state,
            ..
        }) = lease
        else {
            return Err(SubscriptionError::Disposed);
        };

        let initial = *state.borrow_and_update();
        if initial != SubscriptionState::Disposed {
            sink.set_state(initial);
        }

        let mut watching = true;
        loop {
            tokio::select! {
                biased;
                _ = sink.cancelled() => return Ok(()),
                changed = state.changed(), if watching => match changed {
                    Ok(()) => {
                        let current = *state.borrow_and_update();
                        if current != SubscriptionState::Disposed {
                            sink.set_state(current);
                        }
                    }
                    Err(_) => watching = false,
                },
                delivery = deliveries.recv() => match delivery {
                    Some(Ok(event)) => sink.deliver(event).await?,
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn stop(&self) {
        self.leave();
    }

    fn acknowledge(&self, offset: u64) -> Result<(), SubscriptionError> {
        self.client.send(GroupCommand::Ack {
            consumer: self.consumer,
            offset,
        })
    }

    fn reject(&self, offset: u64, reason: &str) -> Result<(), SubscriptionError> {
        self.client.send(GroupCommand::Nack {
            consumer: self.consumer,
            offset,
            reason: reason.to_string(),
        })
    }
}

impl Drop for DurableTransport {
    fn drop(&mut self) {
        self.leave();
    }
}
