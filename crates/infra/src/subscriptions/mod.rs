//! Subscription engine: standard, catch-up and durable delivery over the store's
//! live-tailing primitive.
//!
//! Every variant is the same [`Subscription`] handle driven by a different
//! [`SubscriptionTransport`]; [`SubscriptionManager::subscribe`] picks the transport
//! from [`SubscriptionOptions`].
//!
//! ## States
//!
//! `Created → Replaying → Live → Disposed`. Durable subscriptions additionally cycle
//! `Live ⇄ Reconnecting` when the connection to the log is lost; standard and
//! catch-up subscriptions end on the first transport failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use streamfold_core::{EventRecord, StreamPosition};

use crate::event_store::EventStoreError;

pub mod checkpoint_store;
pub mod durable;
pub mod manager;
pub mod subscription;
pub mod transport;

pub use checkpoint_store::{CheckpointStore, EventStoreCheckpointStore, InMemoryCheckpointStore};
pub use manager::SubscriptionManager;
pub use subscription::{DeliverySink, Subscription};
pub use transport::{CatchUpTransport, StandardTransport, SubscriptionTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Standard,
    CatchUp,
    Durable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    Created,
    Replaying,
    Live,
    Reconnecting,
    Disposed,
}

/// How durable consumers acknowledge deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventAckMode {
    /// One event in flight per consumer; each ack names exactly one event.
    #[default]
    PerEvent,
    /// Several events in flight per consumer; an ack covers every delivered event up
    /// to and including the acked offset.
    Batched,
}

/// Exponential backoff for reconnecting durable subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (1-based) attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Configuration of a durable (named, checkpointed) subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableSubscriptionOptions {
    pub durable_name: String,
    pub max_subscribers: usize,
    /// Deliver the target of link events instead of the link itself.
    pub resolve_links: bool,
    pub min_events_before_checkpoint: u64,
    pub max_events_before_checkpoint: u64,
    /// How often a pending checkpoint that reached the minimum is written.
    pub checkpoint_after: Duration,
    pub ack_mode: EventAckMode,
    /// Where a group without a checkpoint starts.
    pub start_from: StreamPosition,
    pub retry: RetryPolicy,
}

impl DurableSubscriptionOptions {
    pub const DEFAULT_MAX_SUBSCRIBERS: usize = 10;
    pub const DEFAULT_MIN_EVENTS_BEFORE_CHECKPOINT: u64 = 10;
    pub const DEFAULT_MAX_EVENTS_BEFORE_CHECKPOINT: u64 = 1000;

    pub fn new(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            max_subscribers: Self::DEFAULT_MAX_SUBSCRIBERS,
            resolve_links: false,
            min_events_before_checkpoint: Self::DEFAULT_MIN_EVENTS_BEFORE_CHECKPOINT,
            max_events_before_checkpoint: Self::DEFAULT_MAX_EVENTS_BEFORE_CHECKPOINT,
            checkpoint_after: Duration::from_secs(1),
            ack_mode: EventAckMode::PerEvent,
            start_from: StreamPosition::START_OF_STREAM,
            retry: RetryPolicy::default(),
        }
    }

    pub fn max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = max;
        self
    }

    pub fn resolve_links(mut self, resolve: bool) -> Self {
        self.resolve_links = resolve;
        self
    }

    pub fn checkpoint_window(mut self, min: u64, max: u64) -> Self {
        self.min_events_before_checkpoint = min;
        self.max_events_before_checkpoint = max;
        self
    }

    pub fn ack_mode(mut self, mode: EventAckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn start_from(mut self, position: StreamPosition) -> Self {
        self.start_from = position;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), SubscriptionError> {
        if self.durable_name.trim().is_empty() {
            return Err(SubscriptionError::InvalidOptions("durable name must not be empty".into()));
        }
        if self.max_subscribers == 0 {
            return Err(SubscriptionError::InvalidOptions("max_subscribers must be at least 1".into()));
        }
        if self.min_events_before_checkpoint == 0
            || self.min_events_before_checkpoint > self.max_events_before_checkpoint
        {
            return Err(SubscriptionError::InvalidOptions(format!(
                "checkpoint window {}..={} is invalid",
                self.min_events_before_checkpoint, self.max_events_before_checkpoint
            )));
        }
        if self.checkpoint_after.is_zero() {
            return Err(SubscriptionError::InvalidOptions("checkpoint_after must be positive".into()));
        }
        Ok(())
    }

    /// Events a single consumer may hold without acknowledging.
    pub(crate) fn in_flight_per_consumer(&self) -> usize {
        match self.ack_mode {
            EventAckMode::PerEvent => 1,
            EventAckMode::Batched => {
                usize::try_from(self.max_events_before_checkpoint).unwrap_or(usize::MAX)
            }
        }
    }
}

/// Which delivery strategy a subscription uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOptions {
    /// Only events appended after subscribing.
    Standard,
    /// History from `from`, then live, without gaps or duplicates.
    CatchUp { from: StreamPosition },
    Durable(DurableSubscriptionOptions),
}

impl SubscriptionOptions {
    pub fn catch_up() -> Self {
        SubscriptionOptions::CatchUp {
            from: StreamPosition::START_OF_STREAM,
        }
    }

    pub fn kind(&self) -> SubscriptionKind {
        match self {
            SubscriptionOptions::Standard => SubscriptionKind::Standard,
            SubscriptionOptions::CatchUp { .. } => SubscriptionKind::CatchUp,
            SubscriptionOptions::Durable(_) => SubscriptionKind::Durable,
        }
    }
}

/// One event handed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredEvent {
    /// The event itself (the link target when links are resolved).
    pub event: EventRecord,
    /// The link record that pointed at `event`, when it was resolved.
    pub link: Option<EventRecord>,
    /// How many times this event was delivered before.
    pub retry_count: u32,
}

impl DeliveredEvent {
    pub fn new(event: EventRecord) -> Self {
        Self {
            event,
            link: None,
            retry_count: 0,
        }
    }

    pub fn linked(event: EventRecord, link: EventRecord) -> Self {
        Self {
            event,
            link: Some(link),
            retry_count: 0,
        }
    }

    /// Offset in the subscribed stream; this is what acknowledgements refer to.
    pub fn position(&self) -> u64 {
        self.link.as_ref().map_or(self.event.offset, |link| link.offset)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("durable subscription '{name}' already has {max} consumers")]
    MaxSubscribersReached { name: String, max: usize },

    #[error("only durable subscriptions accept acknowledgements")]
    NotAcknowledgeable,

    #[error("invalid subscription options: {0}")]
    InvalidOptions(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("subscription disposed")]
    Disposed,
}

impl SubscriptionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubscriptionError::Store(e) if e.is_transient())
    }
}
