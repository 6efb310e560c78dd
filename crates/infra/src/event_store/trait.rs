use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::Stream;

use streamfold_core::{
    EventDescriptor, EventRecord, EventStreamDescriptor, ExpectedVersion, StreamPosition,
    StreamReadDirection,
};
use streamfold_events::{Cancelled, LiveFeed};

/// Lazy, finite sequence of records returned by [`EventStore::read`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventRecord, EventStoreError>> + Send>>;

/// Live, unbounded sequence of records returned by [`EventStore::subscribe`].
///
/// The feed yields `Err` once if the subscription is lost (transport failure or
/// stream deletion) and ends right after.
pub type RecordFeed = LiveFeed<Result<EventRecord, EventStoreError>>;

/// Event store operation error.
///
/// These are **infrastructure errors** (missing streams, version conflicts, transport
/// loss) as opposed to domain errors (handlers, payload decoding).
///
/// ## Error Categories
///
/// - **StreamNotFound**: the stream was never written to, or was deleted. Not retried.
/// - **OptimisticConcurrency**: the expected-version guard rejected an append. Never
///   retried by the store; the caller reloads, reapplies intent and retries.
/// - **SubscriptionTransportFailure**: a live feed lost its connection to the log.
///   The only transient category (see [`EventStoreError::is_transient`]).
/// - **InvalidAppend / Serialization / Storage**: caller mistakes and backend faults.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventStoreError {
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    #[error(
        "optimistic concurrency check failed on '{stream_id}': expected {expected}, actual {}",
        describe_offset(.actual)
    )]
    OptimisticConcurrency {
        stream_id: String,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("subscription to '{stream_id}' lost: {reason}")]
    SubscriptionTransportFailure { stream_id: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

fn describe_offset(offset: &Option<u64>) -> String {
    match offset {
        Some(o) => o.to_string(),
        None => "none".to_string(),
    }
}

impl EventStoreError {
    /// True for failures worth retrying internally (transport loss only).
    pub fn is_transient(&self) -> bool {
        matches!(self, EventStoreError::SubscriptionTransportFailure { .. })
    }

    pub fn transport(stream_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SubscriptionTransportFailure {
            stream_id: stream_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<Cancelled> for EventStoreError {
    fn from(_: Cancelled) -> Self {
        EventStoreError::Cancelled
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(err: serde_json::Error) -> Self {
        EventStoreError::Serialization(err.to_string())
    }
}

/// Append-only, per-stream event log.
///
/// The `EventStore` is the **persistence layer** of the engine. Events live in named
/// streams (normally one per aggregate instance); within a stream every record has a
/// unique, contiguous, zero-based offset.
///
/// ## Design Principles
///
/// - **No storage assumptions**: works with the in-memory log (tests/dev) and any
///   backend able to honour the contract below
/// - **Optimistic locking**: via [`ExpectedVersion`] (no pessimistic locks; the loser of
///   a race gets `OptimisticConcurrency` and decides what to do)
/// - **Append-only**: records are never mutated; they only disappear through
///   `truncate` (oldest first) or `delete` (whole stream)
///
/// ## Append Semantics
///
/// `append()`:
/// - Rejects empty batches
/// - Checks the expected version against the stream's last offset (`None` if absent)
/// - Assigns offsets `n, n+1, ..., n+k-1` to the `k` events as one atomic batch
/// - Hands the committed records to live subscribers without waiting on them
///
/// ## Read Semantics
///
/// `read()`:
/// - Forwards: every retained record with offset `>= from`, ascending
/// - Backwards: every record with offset `<= from` (all of them for `EndOfStream`),
///   descending
/// - `length` caps the number of records
/// - Empty when no retained record qualifies; `StreamNotFound` only for absent streams
///
/// A read observes the stream either before or after any concurrent append, never a
/// partial batch.
///
/// ## Subscribe Semantics
///
/// `subscribe()` returns a live feed. Starting at `EndOfStream` delivers only records
/// appended afterwards; starting at an offset first delivers the retained history from
/// that offset, with no gap and no duplicate before the first live record.
///
/// ## Cancellation
///
/// Every operation is a future: dropping it (or wrapping it in
/// [`CancellationSignal::run`](streamfold_events::CancellationSignal::run)) cancels it.
/// Implementations must not leave partially applied batches behind when that happens.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream, creating it if needed.
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Describe a stream's current extent.
    async fn get(&self, stream_id: &str) -> Result<EventStreamDescriptor, EventStoreError>;

    /// Read a slice of a stream.
    async fn read(
        &self,
        stream_id: &str,
        direction: StreamReadDirection,
        from: StreamPosition,
        length: Option<u64>,
    ) -> Result<EventStream, EventStoreError>;

    /// Tail a stream.
    async fn subscribe(
        &self,
        stream_id: &str,
        from: StreamPosition,
    ) -> Result<RecordFeed, EventStoreError>;

    /// Remove every record with an offset strictly below `before`
    /// (default: everything, keeping the stream and its offset counter).
    async fn truncate(&self, stream_id: &str, before: Option<u64>) -> Result<(), EventStoreError>;

    /// Remove a stream entirely.
    async fn delete(&self, stream_id: &str) -> Result<(), EventStoreError>;

    async fn contains(&self, stream_id: &str) -> Result<bool, EventStoreError> {
        match self.get(stream_id).await {
            Ok(_) => Ok(true),
            Err(EventStoreError::StreamNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).append(stream_id, events, expected_version).await
    }

    async fn get(&self, stream_id: &str) -> Result<EventStreamDescriptor, EventStoreError> {
        (**self).get(stream_id).await
    }

    async fn read(
        &self,
        stream_id: &str,
        direction: StreamReadDirection,
        from: StreamPosition,
        length: Option<u64>,
    ) -> Result<EventStream, EventStoreError> {
        (**self).read(stream_id, direction, from, length).await
    }

    async fn subscribe(
        &self,
        stream_id: &str,
        from: StreamPosition,
    ) -> Result<RecordFeed, EventStoreError> {
        (**self).subscribe(stream_id, from).await
    }

    async fn truncate(&self, stream_id: &str, before: Option<u64>) -> Result<(), EventStoreError> {
        (**self).truncate(stream_id, before).await
    }

    async fn delete(&self, stream_id: &str) -> Result<(), EventStoreError> {
        (**self).delete(stream_id).await
    }

    async fn contains(&self, stream_id: &str) -> Result<bool, EventStoreError> {
        (**self).contains(stream_id).await
    }
}
