use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use streamfold_core::{
    EventDescriptor, EventRecord, EventStreamDescriptor, ExpectedVersion, StreamPosition,
    StreamReadDirection,
};
use streamfold_events::{FanOut, FanOutError};

use super::r#trait::{EventStore, EventStoreError, EventStream, RecordFeed};

type FeedItem = Result<EventRecord, EventStoreError>;

/// One stream's append log.
///
/// A log with `next_offset == 0` has never been written to (or was deleted) and is
/// reported as absent.
#[derive(Debug, Default)]
struct StreamLog {
    records: VecDeque<EventRecord>,
    next_offset: u64,
    feeds: FanOut<FeedItem>,
}

impl StreamLog {
    fn exists(&self) -> bool {
        self.next_offset > 0
    }

    fn last_offset(&self) -> Option<u64> {
        self.exists().then(|| self.next_offset - 1)
    }

    /// Records with offset >= `from`, ascending.
    fn forwards_from(&self, from: u64) -> impl Iterator<Item = &EventRecord> {
        let skip = match self.records.front() {
            Some(first) => from.saturating_sub(first.offset),
            None => 0,
        };
        self.records
            .iter()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
    }

    fn describe(&self, stream_id: &str) -> EventStreamDescriptor {
        let first = self.records.front();
        let last = self.records.back();
        EventStreamDescriptor {
            stream_id: stream_id.to_string(),
            length: self.records.len() as u64,
            first_offset: first.map(|r| r.offset),
            last_offset: last.map(|r| r.offset),
            first_event_timestamp: first.map(|r| r.timestamp),
            last_event_timestamp: last.map(|r| r.timestamp),
        }
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Storage("lock poisoned".to_string())
}

fn fanout_error(err: FanOutError) -> EventStoreError {
    EventStoreError::Storage(err.to_string())
}

fn take_limit(length: Option<u64>) -> usize {
    length
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX)
}

/// In-memory append-only event store.
///
/// Process-local and volatile; intended for tests/dev and as the reference
/// implementation of the [`EventStore`] contract.
///
/// Each stream has its own lock, so writers to different streams never contend.
/// Live subscribers are registered and fed under the stream's lock, which is what
/// makes history replay and live delivery gap-free, but publishing only enqueues
/// onto unbounded per-subscriber queues and never waits for a consumer.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Arc<RwLock<StreamLog>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, stream_id: &str) -> Result<Arc<RwLock<StreamLog>>, EventStoreError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))
    }

    fn lookup_or_create(&self, stream_id: &str) -> Result<Arc<RwLock<StreamLog>>, EventStoreError> {
        if let Ok(log) = self.lookup(stream_id) {
            return Ok(log);
        }
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        Ok(streams.entry(stream_id.to_string()).or_default().clone())
    }

    /// Cut every live feed on `stream_id` with a transport failure.
    ///
    /// Simulates losing the connection to the backing log; returns how many feeds
    /// were cut.
    pub fn interrupt_subscriptions(&self, stream_id: &str) -> Result<usize, EventStoreError> {
        let log = self.lookup(stream_id)?;
        let log = log.read().map_err(|_| poisoned())?;
        let count = log.feeds.subscriber_count();
        log.feeds
            .close_with(Err(EventStoreError::transport(
                stream_id,
                "connection to the event log was interrupted",
            )))
            .map_err(fanout_error)?;
        warn!(stream_id, count, "interrupted live subscriptions");
        Ok(count)
    }

    /// Number of live feeds currently attached to `stream_id`.
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.lookup(stream_id)
            .ok()
            .and_then(|log| log.read().ok().map(|log| log.feeds.subscriber_count()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        stream_id: &str,
        events: Vec<EventDescriptor>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        if stream_id.trim().is_empty() {
            return Err(EventStoreError::InvalidAppend("stream id must not be empty".to_string()));
        }
        if events.is_empty() {
            return Err(EventStoreError::InvalidAppend(
                "at least one event is required".to_string(),
            ));
        }
        if let Some(idx) = events.iter().position(|e| e.event_type.is_empty()) {
            return Err(EventStoreError::InvalidAppend(format!(
                "event at index {idx} has no type"
            )));
        }

        let log = match self.lookup(stream_id) {
            Ok(log) => log,
            Err(EventStoreError::StreamNotFound(_)) if !expected_version.matches(None) => {
                debug!(%expected_version, "append rejected on absent stream");
                return Err(EventStoreError::OptimisticConcurrency {
                    stream_id: stream_id.to_string(),
                    expected: expected_version,
                    actual: None,
                });
            }
            Err(EventStoreError::StreamNotFound(_)) => self.lookup_or_create(stream_id)?,
            Err(err) => return Err(err),
        };
        let mut log = log.write().map_err(|_| poisoned())?;

        let actual = log.last_offset();
        if !expected_version.matches(actual) {
            debug!(%expected_version, ?actual, "append rejected");
            return Err(EventStoreError::OptimisticConcurrency {
                stream_id: stream_id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        // Assign offsets and append as one batch.
        let timestamp = Utc::now();
        let first = log.next_offset;
        let committed: Vec<EventRecord> = events
            .into_iter()
            .enumerate()
            .map(|(i, e)| EventRecord {
                id: Uuid::now_v7().to_string(),
                stream_id: stream_id.to_string(),
                offset: first + i as u64,
                timestamp,
                event_type: e.event_type,
                data: e.data,
                metadata: e.metadata,
            })
            .collect();
        log.next_offset += committed.len() as u64;
        log.records.extend(committed.iter().cloned());

        for record in &committed {
            if let Err(err) = log.feeds.publish(Ok(record.clone())) {
                warn!(error = %err, offset = record.offset, "failed to notify live subscribers");
            }
        }

        debug!(first, last = log.next_offset - 1, "appended");
        Ok(committed)
    }

    async fn get(&self, stream_id: &str) -> Result<EventStreamDescriptor, EventStoreError> {
        let log = self.lookup(stream_id)?;
        let log = log.read().map_err(|_| poisoned())?;
        if !log.exists() {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }
        Ok(log.describe(stream_id))
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        stream_id: &str,
        direction: StreamReadDirection,
        from: StreamPosition,
        length: Option<u64>,
    ) -> Result<EventStream, EventStoreError> {
        let log = self.lookup(stream_id)?;
        let log = log.read().map_err(|_| poisoned())?;
        if !log.exists() {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        let limit = take_limit(length);
        let records: Vec<EventRecord> = match (direction, from) {
            (StreamReadDirection::Forwards, StreamPosition::Offset(k)) => {
                log.forwards_from(k).take(limit).cloned().collect()
            }
            (StreamReadDirection::Forwards, StreamPosition::EndOfStream) => Vec::new(),
            (StreamReadDirection::Backwards, StreamPosition::EndOfStream) => {
                log.records.iter().rev().take(limit).cloned().collect()
            }
            (StreamReadDirection::Backwards, StreamPosition::Offset(k)) => log
                .records
                .iter()
                .rev()
                .skip_while(|r| r.offset > k)
                .take(limit)
                .cloned()
                .collect(),
        };

        Ok(Box::pin(tokio_stream::iter(records.into_iter().map(Ok))))
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        stream_id: &str,
        from: StreamPosition,
    ) -> Result<RecordFeed, EventStoreError> {
        let log = self.lookup(stream_id)?;
        // Holding the stream lock keeps appends out while the backlog is copied and the
        // feed registered, so nothing falls between history and live delivery.
        let log = log.read().map_err(|_| poisoned())?;
        if !log.exists() {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        let backlog: Vec<FeedItem> = match from {
            StreamPosition::EndOfStream => Vec::new(),
            StreamPosition::Offset(k) => log.forwards_from(k).cloned().map(Ok).collect(),
        };
        log.feeds.subscribe_with(backlog).map_err(fanout_error)
    }

    #[instrument(skip(self))]
    async fn truncate(&self, stream_id: &str, before: Option<u64>) -> Result<(), EventStoreError> {
        let log = self.lookup(stream_id)?;
        let mut log = log.write().map_err(|_| poisoned())?;
        if !log.exists() {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        let before = before.unwrap_or(log.next_offset).min(log.next_offset);
        while log.records.front().is_some_and(|r| r.offset < before) {
            log.records.pop_front();
        }
        debug!(before, retained = log.records.len(), "truncated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, stream_id: &str) -> Result<(), EventStoreError> {
        let log = self.lookup(stream_id)?;
        let mut log = log.write().map_err(|_| poisoned())?;
        if !log.exists() {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        log.records.clear();
        log.next_offset = 0;
        log.feeds
            .close_with(Err(EventStoreError::StreamNotFound(stream_id.to_string())))
            .map_err(fanout_error)?;
        debug!("deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    use super::*;

    fn user_created() -> EventDescriptor {
        EventDescriptor::new("user-created", json!({ "firstName": "John" }))
    }

    fn numbered(n: u64) -> Vec<EventDescriptor> {
        (0..n)
            .map(|i| EventDescriptor::new("numbered", json!({ "i": i })))
            .collect()
    }

    async fn offsets(
        store: &InMemoryEventStore,
        stream_id: &str,
        direction: StreamReadDirection,
        from: StreamPosition,
        length: Option<u64>,
    ) -> Vec<u64> {
        store
            .read(stream_id, direction, from, length)
            .await
            .unwrap()
            .map(|r| r.unwrap().offset)
            .collect()
            .await
    }

    #[tokio::test]
    async fn absent_streams_are_not_found() {
        let store = InMemoryEventStore::new();

        assert!(matches!(
            store.get("nope").await,
            Err(EventStoreError::StreamNotFound(_))
        ));
        assert!(matches!(
            store
                .read("nope", StreamReadDirection::Forwards, StreamPosition::START_OF_STREAM, None)
                .await,
            Err(EventStoreError::StreamNotFound(_))
        ));
        assert!(matches!(
            store.subscribe("nope", StreamPosition::EndOfStream).await,
            Err(EventStoreError::StreamNotFound(_))
        ));
        assert!(!store.contains("nope").await.unwrap());
    }

    #[tokio::test]
    async fn user_scenario_conflicts_on_stale_version() {
        let store = InMemoryEventStore::new();
        let committed = store
            .append(
                "user-1",
                vec![user_created(), EventDescriptor::of_type("user-logged-in")],
                ExpectedVersion::Any,
            )
            .await
            .unwrap();
        assert_eq!(committed.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(store.get("user-1").await.unwrap().length, 2);

        let err = store
            .append("user-1", vec![user_created()], ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EventStoreError::OptimisticConcurrency {
                stream_id: "user-1".to_string(),
                expected: ExpectedVersion::Exact(0),
                actual: Some(1),
            }
        );
        assert_eq!(store.get("user-1").await.unwrap().length, 2);
    }

    #[tokio::test]
    async fn no_stream_expectation_rejects_existing_streams() {
        let store = InMemoryEventStore::new();
        store
            .append("s", vec![user_created()], ExpectedVersion::NoStream)
            .await
            .unwrap();

        let err = store
            .append("s", vec![user_created()], ExpectedVersion::NoStream)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::OptimisticConcurrency {
                expected: ExpectedVersion::NoStream,
                actual: Some(0),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn exact_expectation_on_absent_stream_reports_no_actual() {
        let store = InMemoryEventStore::new();
        let err = store
            .append("s", vec![user_created()], ExpectedVersion::Exact(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::OptimisticConcurrency { actual: None, .. }
        ));
        // A failed guard must not create the stream, nor leave an empty log behind.
        assert!(!store.contains("s").await.unwrap());
        assert!(store.streams.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_batches_are_rejected() {
        let store = InMemoryEventStore::new();
        let err = store.append("s", vec![], ExpectedVersion::Any).await.unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[tokio::test]
    async fn forward_and_backward_reads() {
        let store = InMemoryEventStore::new();
        store.append("s", numbered(5), ExpectedVersion::Any).await.unwrap();

        let fwd = offsets(&store, "s", StreamReadDirection::Forwards, StreamPosition::Offset(2), None).await;
        assert_eq!(fwd, vec![2, 3, 4]);

        let capped = offsets(&store, "s", StreamReadDirection::Forwards, StreamPosition::Offset(1), Some(2)).await;
        assert_eq!(capped, vec![1, 2]);

        let back = offsets(&store, "s", StreamReadDirection::Backwards, StreamPosition::EndOfStream, None).await;
        assert_eq!(back, vec![4, 3, 2, 1, 0]);

        let back_from = offsets(&store, "s", StreamReadDirection::Backwards, StreamPosition::Offset(2), None).await;
        assert_eq!(back_from, vec![2, 1, 0]);

        let past_end = offsets(&store, "s", StreamReadDirection::Forwards, StreamPosition::Offset(9), None).await;
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn truncate_keeps_offsets_and_identity() {
        let store = InMemoryEventStore::new();
        store.append("s", numbered(4), ExpectedVersion::Any).await.unwrap();

        store.truncate("s", Some(2)).await.unwrap();
        let fwd = offsets(&store, "s", StreamReadDirection::Forwards, StreamPosition::START_OF_STREAM, None).await;
        assert_eq!(fwd, vec![2, 3]);

        let descriptor = store.get("s").await.unwrap();
        assert_eq!(descriptor.length, 2);
        assert_eq!(descriptor.first_offset, Some(2));

        store.truncate("s", None).await.unwrap();
        let descriptor = store.get("s").await.unwrap();
        assert_eq!(descriptor.length, 0);
        assert_eq!(descriptor.last_offset, None);

        // Offsets are never reused.
        let next = store.append("s", numbered(1), ExpectedVersion::Exact(3)).await.unwrap();
        assert_eq!(next[0].offset, 4);
    }

    #[tokio::test]
    async fn delete_removes_the_stream() {
        let store = InMemoryEventStore::new();
        store.append("s", numbered(2), ExpectedVersion::Any).await.unwrap();
        let mut feed = store.subscribe("s", StreamPosition::EndOfStream).await.unwrap();

        store.delete("s").await.unwrap();

        assert!(matches!(store.get("s").await, Err(EventStoreError::StreamNotFound(_))));
        assert!(matches!(feed.recv().await, Some(Err(EventStoreError::StreamNotFound(_)))));
        assert!(feed.recv().await.is_none());
        assert!(matches!(store.delete("s").await, Err(EventStoreError::StreamNotFound(_))));

        let recreated = store.append("s", numbered(1), ExpectedVersion::NoStream).await.unwrap();
        assert_eq!(recreated[0].offset, 0);
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_then_live() {
        let store = InMemoryEventStore::new();
        store.append("s", numbered(3), ExpectedVersion::Any).await.unwrap();

        let mut from_start = store.subscribe("s", StreamPosition::Offset(1)).await.unwrap();
        let mut live_only = store.subscribe("s", StreamPosition::EndOfStream).await.unwrap();
        store.append("s", numbered(1), ExpectedVersion::Exact(2)).await.unwrap();

        for expected in [1, 2, 3] {
            assert_eq!(from_start.recv().await.unwrap().unwrap().offset, expected);
        }
        assert_eq!(live_only.recv().await.unwrap().unwrap().offset, 3);
        assert!(live_only.try_recv().is_none());
    }

    #[tokio::test]
    async fn interrupted_feeds_report_transport_failure() {
        let store = InMemoryEventStore::new();
        store.append("s", numbered(1), ExpectedVersion::Any).await.unwrap();
        let mut feed = store.subscribe("s", StreamPosition::EndOfStream).await.unwrap();

        assert_eq!(store.interrupt_subscriptions("s").unwrap(), 1);
        let err = feed.recv().await.unwrap().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.subscriber_count("s"), 0);
    }

    #[tokio::test]
    async fn concurrent_writers_get_contiguous_offsets() {
        let store = Arc::new(InMemoryEventStore::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    store.append("hot", numbered(3), ExpectedVersion::Any).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let all = offsets(&store, "hot", StreamReadDirection::Forwards, StreamPosition::START_OF_STREAM, None).await;
        assert_eq!(all, (0..240).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn batches_receive_contiguous_offsets(batches in proptest::collection::vec(1u64..6, 1..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let mut expected_next = 0u64;
                for size in &batches {
                    let committed = store.append("p", numbered(*size), ExpectedVersion::Any).await.unwrap();
                    let got: Vec<u64> = committed.iter().map(|r| r.offset).collect();
                    let want: Vec<u64> = (expected_next..expected_next + size).collect();
                    prop_assert_eq!(got, want);
                    expected_next += size;
                }
                prop_assert_eq!(store.get("p").await.unwrap().length, expected_next);
                Ok(())
            })?;
        }
    }
}
