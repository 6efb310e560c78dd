//! Event-sourcing repository: loads aggregates by folding their stream and commits
//! their pending events under an optimistic concurrency guard.
//!
//! ## Load
//!
//! ```text
//! latest usable snapshot? ──yes──> seed state, replay offsets > snapshot.version
//!          │ no
//!          └──────────────────────> replay the whole stream from offset 0
//! ```
//!
//! Every replayed record goes through [`EventMigrations`] first, so superseded event
//! types are upcast before the aggregate's fold table sees them.
//!
//! ## Commit
//!
//! Pending events are appended with the version the aggregate had before raising
//! them (`NoStream` for a new aggregate). The pending list is only drained after the
//! append succeeded; on `OptimisticConcurrency` it stays intact and the caller
//! decides how to reconcile. A snapshot is written after a commit once the aggregate
//! moved `SnapshotPolicy` events past the previous one.
//!
//! ## Unit of work
//!
//! [`EventSourcingRepository::get`] and [`EventSourcingRepository::track`] register
//! aggregates; [`EventSourcingRepository::save_changes`] commits every tracked
//! aggregate with pending events, each on its own.

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use streamfold_core::{
    Aggregate, AggregateRoot, AggregateState, DomainError, EventRecord, ExpectedVersion,
    StreamPosition, StreamReadDirection,
};

use crate::event_store::{EventStore, EventStoreError};

pub mod migration;
pub mod snapshot;

pub use migration::EventMigrations;
pub use snapshot::{
    EventStoreSnapshotStore, InMemorySnapshotStore, RawSnapshot, Snapshot, SnapshotStore,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("aggregate '{0}' not found")]
    AggregateNotFound(String),

    #[error(
        "aggregate '{aggregate_id}' was modified concurrently: expected {expected}, actual {}",
        .actual.map_or_else(|| "none".to_string(), |v| v.to_string())
    )]
    OptimisticConcurrency {
        aggregate_id: String,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("no migration path for event '{event_type}' at offset {offset} of '{stream_id}'")]
    UnsupportedEventMigration {
        stream_id: String,
        offset: u64,
        event_type: String,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(EventStoreError),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

impl RepositoryError {
    fn from_store(err: EventStoreError, aggregate_id: &str) -> Self {
        match err {
            EventStoreError::StreamNotFound(_) => RepositoryError::AggregateNotFound(aggregate_id.to_string()),
            EventStoreError::OptimisticConcurrency { expected, actual, .. } => {
                RepositoryError::OptimisticConcurrency {
                    aggregate_id: aggregate_id.to_string(),
                    expected,
                    actual,
                }
            }
            other => RepositoryError::Store(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::OptimisticConcurrency { .. })
    }
}

/// Events one aggregate committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedChanges {
    pub aggregate_id: String,
    pub stream_id: String,
    pub records: Vec<EventRecord>,
}

/// `save_changes` outcome when at least one aggregate failed to commit.
///
/// Aggregates commit independently, so `committed` lists what did go through.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{} aggregate(s) failed to commit, {} committed", .failures.len(), .committed.len())]
pub struct SaveChangesError {
    pub committed: Vec<CommittedChanges>,
    pub failures: Vec<(String, RepositoryError)>,
}

/// When the repository writes snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPolicy {
    Disabled,
    /// After every `n` committed events since the previous snapshot.
    Every(NonZeroU64),
}

impl SnapshotPolicy {
    pub const DEFAULT_FREQUENCY: u64 = 10;

    /// `0` disables snapshots.
    pub fn from_frequency(frequency: u64) -> Self {
        NonZeroU64::new(frequency).map_or(SnapshotPolicy::Disabled, SnapshotPolicy::Every)
    }

    /// `version` is the aggregate's committed version, `last` the version (last
    /// folded offset) of its newest snapshot.
    pub fn is_due(self, version: u64, last: Option<u64>) -> bool {
        match self {
            SnapshotPolicy::Disabled => false,
            SnapshotPolicy::Every(n) => {
                let covered = last.map_or(0, |v| v + 1);
                version.saturating_sub(covered) >= n.get()
            }
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self::from_frequency(Self::DEFAULT_FREQUENCY)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryOptions {
    pub snapshot_policy: SnapshotPolicy,
}

#[derive(Debug)]
struct Tracked<A: Aggregate> {
    root: AggregateRoot<A>,
    last_snapshot: Option<u64>,
}

pub struct EventSourcingRepository<A: Aggregate, S> {
    store: S,
    snapshots: Arc<dyn SnapshotStore>,
    migrations: Arc<EventMigrations>,
    options: RepositoryOptions,
    tracked: BTreeMap<String, Tracked<A>>,
}

impl<A, S> EventSourcingRepository<A, S>
where
    A: Aggregate,
    S: EventStore,
{
    /// Repository with in-memory snapshots, no migrations and default options.
    pub fn new(store: S) -> Self {
        Self {
            store,
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            migrations: Arc::new(EventMigrations::new()),
            options: RepositoryOptions::default(),
            tracked: BTreeMap::new(),
        }
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_migrations(mut self, migrations: impl Into<Arc<EventMigrations>>) -> Self {
        self.migrations = migrations.into();
        self
    }

    pub fn with_options(mut self, options: RepositoryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stream_id(id: &str) -> String {
        format!("{}-{id}", A::AGGREGATE_TYPE)
    }

    pub async fn contains(&self, id: &str) -> Result<bool, RepositoryError> {
        self.store
            .contains(&Self::stream_id(id))
            .await
            .map_err(RepositoryError::Store)
    }

    /// Load the current state without tracking it.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE))]
    pub async fn load(&self, id: &str) -> Result<AggregateRoot<A>, RepositoryError> {
        Ok(self.rehydrate(id).await?.root)
    }

    /// Rebuild the state as of `version` (inclusive offset) by full replay.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE))]
    pub async fn load_at_version(&self, id: &str, version: u64) -> Result<AggregateRoot<A>, RepositoryError> {
        let stream_id = Self::stream_id(id);
        self.store
            .get(&stream_id)
            .await
            .map_err(|e| RepositoryError::from_store(e, id))?;

        let mut root = AggregateRoot::new(id);
        self.replay(&mut root, &stream_id, 0, Some(version)).await?;
        if root.version() == 0 {
            return Err(RepositoryError::AggregateNotFound(id.to_string()));
        }
        Ok(root)
    }

    /// Load and track an aggregate; an already tracked instance is returned as is.
    pub async fn get(&mut self, id: &str) -> Result<&mut AggregateRoot<A>, RepositoryError> {
        if !self.tracked.contains_key(id) {
            let loaded = self.rehydrate(id).await?;
            self.tracked.insert(id.to_string(), loaded);
        }
        self.tracked
            .get_mut(id)
            .map(|t| &mut t.root)
            .ok_or_else(|| RepositoryError::AggregateNotFound(id.to_string()))
    }

    /// Track a new aggregate so the next `save_changes` commits it.
    pub fn track(&mut self, root: AggregateRoot<A>) -> Result<&mut AggregateRoot<A>, RepositoryError> {
        let id = root.id().to_string();
        if self.tracked.contains_key(&id) {
            return Err(RepositoryError::InvalidOperation(format!(
                "aggregate '{id}' is already tracked"
            )));
        }
        let tracked = self.tracked.entry(id).or_insert(Tracked {
            root,
            last_snapshot: None,
        });
        Ok(&mut tracked.root)
    }

    pub fn tracked(&self, id: &str) -> Option<&AggregateRoot<A>> {
        self.tracked.get(id).map(|t| &t.root)
    }

    pub fn tracked_mut(&mut self, id: &str) -> Option<&mut AggregateRoot<A>> {
        self.tracked.get_mut(id).map(|t| &mut t.root)
    }

    pub fn untrack(&mut self, id: &str) -> Option<AggregateRoot<A>> {
        self.tracked.remove(id).map(|t| t.root)
    }

    /// Commit a brand-new aggregate.
    #[instrument(skip(self, root), fields(aggregate_type = A::AGGREGATE_TYPE, id = %root.id()))]
    pub async fn add(&self, root: &mut AggregateRoot<A>) -> Result<CommittedChanges, RepositoryError> {
        if root.version() != 0 {
            return Err(RepositoryError::InvalidOperation(format!(
                "aggregate '{}' already exists at version {}",
                root.id(),
                root.version()
            )));
        }
        if !root.has_pending_events() {
            return Err(RepositoryError::InvalidOperation(format!(
                "aggregate '{}' has no events to add",
                root.id()
            )));
        }
        let last_snapshot = None;
        self.commit(root, last_snapshot).await.map(|(changes, _)| changes)
    }

    /// Commit the pending events of an existing aggregate; a no-op without any.
    #[instrument(skip(self, root), fields(aggregate_type = A::AGGREGATE_TYPE, id = %root.id()))]
    pub async fn update(&self, root: &mut AggregateRoot<A>) -> Result<CommittedChanges, RepositoryError> {
        let last_snapshot = self.last_snapshot_version(root.id()).await;
        self.commit(root, last_snapshot).await.map(|(changes, _)| changes)
    }

    /// Delete the aggregate's stream and snapshots. Returns whether it existed.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE))]
    pub async fn remove(&mut self, id: &str) -> Result<bool, RepositoryError> {
        self.tracked.remove(id);
        let existed = match self.store.delete(&Self::stream_id(id)).await {
            Ok(()) => true,
            Err(EventStoreError::StreamNotFound(_)) => false,
            Err(e) => return Err(RepositoryError::Store(e)),
        };
        self.snapshots
            .delete(A::AGGREGATE_TYPE, id)
            .await
            .map_err(RepositoryError::Store)?;
        Ok(existed)
    }

    /// Commit every tracked aggregate with pending events.
    ///
    /// A failing aggregate keeps its pending events and does not stop the others.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE, tracked = self.tracked.len()))]
    pub async fn save_changes(&mut self) -> Result<Vec<CommittedChanges>, SaveChangesError> {
        let mut committed = Vec::new();
        let mut failures = Vec::new();

        let ids: Vec<String> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.root.has_pending_events())
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids {
            // Entries stay tracked across the append; pending events drain only after it.
            let Some(entry) = self.tracked.get(&id) else { continue };
            let last_snapshot = entry.last_snapshot;
            let records = match self.append_pending(&entry.root).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(aggregate_id = %id, error = %err, "aggregate failed to commit");
                    failures.push((id.clone(), err));
                    continue;
                }
            };

            let Some(entry) = self.tracked.get_mut(&id) else { continue };
            entry.root.mark_committed();
            let Some(entry) = self.tracked.get(&id) else { continue };
            let last_snapshot = self.snapshot_if_due(&entry.root, last_snapshot).await;
            if let Some(entry) = self.tracked.get_mut(&id) {
                entry.last_snapshot = last_snapshot;
            }
            committed.push(CommittedChanges {
                aggregate_id: id.clone(),
                stream_id: Self::stream_id(&id),
                records,
            });
        }

        if failures.is_empty() {
            Ok(committed)
        } else {
            Err(SaveChangesError { committed, failures })
        }
    }

    /// Write a snapshot of `root` now, regardless of the policy.
    pub async fn take_snapshot(&self, root: &AggregateRoot<A>) -> Result<(), RepositoryError> {
        if root.version() == 0 || root.has_pending_events() {
            return Err(RepositoryError::Snapshot(format!(
                "aggregate '{}' has no committed state to snapshot",
                root.id()
            )));
        }
        let snapshot = Snapshot {
            aggregate_id: root.id().to_string(),
            version: root.version() - 1,
            state: root.aggregate_state(),
            taken_at: Utc::now(),
        }
        .encode()
        .map_err(|e| RepositoryError::Snapshot(e.to_string()))?;

        self.snapshots
            .save(A::AGGREGATE_TYPE, snapshot)
            .await
            .map_err(|e| RepositoryError::Snapshot(e.to_string()))
    }

    async fn commit(
        &self,
        root: &mut AggregateRoot<A>,
        last_snapshot: Option<u64>,
    ) -> Result<(CommittedChanges, Option<u64>), RepositoryError> {
        let stream_id = Self::stream_id(root.id());
        if !root.has_pending_events() {
            let changes = CommittedChanges {
                aggregate_id: root.id().to_string(),
                stream_id,
                records: Vec::new(),
            };
            return Ok((changes, last_snapshot));
        }

        let records = self.append_pending(root).await?;
        root.mark_committed();

        let last_snapshot = self.snapshot_if_due(root, last_snapshot).await;
        let changes = CommittedChanges {
            aggregate_id: root.id().to_string(),
            stream_id,
            records,
        };
        Ok((changes, last_snapshot))
    }

    /// Append the pending events of `root` without touching it.
    async fn append_pending(&self, root: &AggregateRoot<A>) -> Result<Vec<EventRecord>, RepositoryError> {
        let stream_id = Self::stream_id(root.id());
        let expected = root.expected_version();
        let records = self
            .store
            .append(&stream_id, root.pending_events().to_vec(), expected)
            .await
            .map_err(|e| RepositoryError::from_store(e, root.id()))?;
        debug!(stream_id = %stream_id, %expected, count = records.len(), "committed");
        Ok(records)
    }

    async fn snapshot_if_due(&self, root: &AggregateRoot<A>, last: Option<u64>) -> Option<u64> {
        if !self.options.snapshot_policy.is_due(root.version(), last) {
            return last;
        }
        match self.take_snapshot(root).await {
            Ok(()) => {
                debug!(id = %root.id(), version = root.version() - 1, "snapshot taken");
                Some(root.version() - 1)
            }
            Err(err) => {
                warn!(id = %root.id(), error = %err, "failed to take snapshot");
                last
            }
        }
    }

    async fn last_snapshot_version(&self, id: &str) -> Option<u64> {
        if let Some(tracked) = self.tracked.get(id) {
            return tracked.last_snapshot;
        }
        match self.snapshots.load(A::AGGREGATE_TYPE, id).await {
            Ok(snapshot) => snapshot.map(|s| s.version),
            Err(err) => {
                warn!(id, error = %err, "failed to look up snapshot");
                None
            }
        }
    }

    /// Latest snapshot that can seed `id`, if any.
    ///
    /// Snapshots that fail to load or decode, or that point past the end of the
    /// stream, are ignored.
    async fn usable_snapshot(&self, id: &str, last_offset: u64) -> Option<Snapshot<AggregateState<A>>> {
        let raw = match self.snapshots.load(A::AGGREGATE_TYPE, id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(id, error = %err, "failed to load snapshot, replaying the full stream");
                return None;
            }
        };
        let version = raw.version;
        let snapshot = match raw.decode::<AggregateState<A>>() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(id, version, error = %err, "undecodable snapshot, replaying the full stream");
                return None;
            }
        };
        if snapshot.version > last_offset
            || snapshot.state.state_version != snapshot.version + 1
            || snapshot.state.id != id
        {
            warn!(id, version, last_offset, "stale snapshot, replaying the full stream");
            return None;
        }
        Some(snapshot)
    }

    async fn rehydrate(&self, id: &str) -> Result<Tracked<A>, RepositoryError> {
        let stream_id = Self::stream_id(id);
        let descriptor = self
            .store
            .get(&stream_id)
            .await
            .map_err(|e| RepositoryError::from_store(e, id))?;
        let Some(last_offset) = descriptor.last_offset else {
            return Err(RepositoryError::AggregateNotFound(id.to_string()));
        };

        let (mut root, from, last_snapshot) = match self.usable_snapshot(id, last_offset).await {
            Some(snapshot) => (
                AggregateRoot::from_state(snapshot.state),
                snapshot.version + 1,
                Some(snapshot.version),
            ),
            None => (AggregateRoot::new(id), 0, None),
        };
        self.replay(&mut root, &stream_id, from, None).await?;

        if root.version() == 0 {
            return Err(RepositoryError::AggregateNotFound(id.to_string()));
        }
        debug!(id, version = root.version(), from_snapshot = last_snapshot.is_some(), "aggregate loaded");
        Ok(Tracked { root, last_snapshot })
    }

    /// Fold records `from..=until` of `stream_id` into `root`.
    async fn replay(
        &self,
        root: &mut AggregateRoot<A>,
        stream_id: &str,
        from: u64,
        until: Option<u64>,
    ) -> Result<(), RepositoryError> {
        let mut records = self
            .store
            .read(stream_id, StreamReadDirection::Forwards, StreamPosition::Offset(from), None)
            .await
            .map_err(|e| RepositoryError::from_store(e, root.id()))?;

        while let Some(record) = records.next().await {
            let record = record.map_err(|e| RepositoryError::from_store(e, root.id()))?;
            if until.is_some_and(|until| record.offset > until) {
                break;
            }
            let record = self.migrations.upcast::<A>(record)?;
            root.apply_committed(&record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use std::time::Duration;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use streamfold_core::{DomainEvent, EventDescriptor, EventHandlers, EventStreamDescriptor};

    use super::*;
    use crate::event_store::{EventStream, InMemoryEventStore, RecordFeed};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Added {
        n: i64,
    }

    impl DomainEvent for Added {
        const EVENT_TYPE: &'static str = "tally-added";
    }

    impl Aggregate for Tally {
        const AGGREGATE_TYPE: &'static str = "tally";

        fn handlers() -> &'static EventHandlers<Self> {
            static HANDLERS: OnceLock<EventHandlers<Tally>> = OnceLock::new();
            HANDLERS.get_or_init(|| EventHandlers::new().on(|t: &mut Tally, e: Added| t.total += e.n))
        }
    }

    type Repo = EventSourcingRepository<Tally, Arc<InMemoryEventStore>>;

    fn repo() -> Repo {
        EventSourcingRepository::new(Arc::new(InMemoryEventStore::new()))
    }

    /// Store whose appends take a while to go through.
    struct SlowAppends {
        inner: InMemoryEventStore,
        delay: Duration,
    }

    #[async_trait]
    impl EventStore for SlowAppends {
        async fn append(
            &self,
            stream_id: &str,
            events: Vec<EventDescriptor>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<EventRecord>, EventStoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.append(stream_id, events, expected_version).await
        }

        async fn get(&self, stream_id: &str) -> Result<EventStreamDescriptor, EventStoreError> {
            self.inner.get(stream_id).await
        }

        async fn read(
            &self,
            stream_id: &str,
            direction: StreamReadDirection,
            from: StreamPosition,
            length: Option<u64>,
        ) -> Result<EventStream, EventStoreError> {
            self.inner.read(stream_id, direction, from, length).await
        }

        async fn subscribe(&self, stream_id: &str, from: StreamPosition) -> Result<RecordFeed, EventStoreError> {
            self.inner.subscribe(stream_id, from).await
        }

        async fn truncate(&self, stream_id: &str, before: Option<u64>) -> Result<(), EventStoreError> {
            self.inner.truncate(stream_id, before).await
        }

        async fn delete(&self, stream_id: &str) -> Result<(), EventStoreError> {
            self.inner.delete(stream_id).await
        }
    }

    fn tally_with(id: &str, adds: &[i64]) -> AggregateRoot<Tally> {
        let mut root = AggregateRoot::new(id);
        for n in adds {
            root.raise(Added { n: *n }).unwrap();
        }
        root
    }

    #[test]
    fn snapshot_policy_schedule() {
        let every_ten = SnapshotPolicy::default();
        assert!(!every_ten.is_due(9, None));
        assert!(every_ten.is_due(10, None));
        assert!(!every_ten.is_due(19, Some(9)));
        assert!(every_ten.is_due(20, Some(9)));
        assert!(!SnapshotPolicy::from_frequency(0).is_due(1000, None));
    }

    #[tokio::test]
    async fn add_then_load_round_trips() {
        let repo = repo();
        let mut root = tally_with("1", &[2, 3]);
        let changes = repo.add(&mut root).await.unwrap();

        assert_eq!(changes.stream_id, "tally-1");
        assert_eq!(changes.records.len(), 2);
        assert!(!root.has_pending_events());
        assert_eq!(root.version(), 2);

        let loaded = repo.load("1").await.unwrap();
        assert_eq!(loaded.aggregate_state(), root.aggregate_state());
        assert!(repo.contains("1").await.unwrap());
        assert!(!repo.contains("2").await.unwrap());
    }

    #[tokio::test]
    async fn add_rejects_existing_or_empty_aggregates() {
        let repo = repo();
        let mut empty = AggregateRoot::<Tally>::new("1");
        assert!(matches!(
            repo.add(&mut empty).await,
            Err(RepositoryError::InvalidOperation(_))
        ));

        let mut root = tally_with("1", &[1]);
        repo.add(&mut root).await.unwrap();
        root.raise(Added { n: 1 }).unwrap();
        assert!(matches!(
            repo.add(&mut root).await,
            Err(RepositoryError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn conflicting_update_keeps_pending_events() {
        let repo = repo();
        let mut root = tally_with("1", &[1]);
        repo.add(&mut root).await.unwrap();

        let mut first = repo.load("1").await.unwrap();
        let mut second = repo.load("1").await.unwrap();
        first.raise(Added { n: 10 }).unwrap();
        second.raise(Added { n: 20 }).unwrap();

        repo.update(&mut first).await.unwrap();
        let err = repo.update(&mut second).await.unwrap_err();
        assert_eq!(
            err,
            RepositoryError::OptimisticConcurrency {
                aggregate_id: "1".into(),
                expected: ExpectedVersion::Exact(0),
                actual: Some(1),
            }
        );
        assert!(err.is_conflict());
        assert_eq!(second.pending_events().len(), 1);
    }

    #[tokio::test]
    async fn update_without_pending_events_is_a_no_op() {
        let repo = repo();
        let mut root = tally_with("1", &[1]);
        repo.add(&mut root).await.unwrap();
        let changes = repo.update(&mut root).await.unwrap();
        assert!(changes.records.is_empty());
        assert_eq!(repo.store().get("tally-1").await.unwrap().length, 1);
    }

    #[tokio::test]
    async fn save_changes_commits_tracked_aggregates_independently() {
        let mut repo = repo();
        let mut existing = tally_with("a", &[1]);
        repo.add(&mut existing).await.unwrap();

        repo.get("a").await.unwrap().raise(Added { n: 5 }).unwrap();
        repo.track(tally_with("b", &[7])).unwrap();

        // Someone else writes to "a" behind the unit of work's back.
        existing.raise(Added { n: 100 }).unwrap();
        repo.update(&mut existing).await.unwrap();

        let err = repo.save_changes().await.unwrap_err();
        assert_eq!(err.committed.len(), 1);
        assert_eq!(err.committed[0].aggregate_id, "b");
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "a");
        assert!(err.failures[0].1.is_conflict());

        assert!(repo.tracked("a").unwrap().has_pending_events());
        assert!(!repo.tracked("b").unwrap().has_pending_events());
        assert_eq!(repo.load("b").await.unwrap().state().total, 7);
    }

    #[tokio::test]
    async fn cancelled_save_changes_keeps_pending_events() {
        let mut repo = EventSourcingRepository::<Tally, _>::new(SlowAppends {
            inner: InMemoryEventStore::new(),
            delay: Duration::from_millis(200),
        });
        repo.track(tally_with("a", &[1])).unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(10), repo.save_changes()).await;
        assert!(outcome.is_err());

        let tracked = repo.tracked("a").expect("aggregate still tracked");
        assert_eq!(tracked.pending_events().len(), 1);
        assert_eq!(tracked.version(), 0);
        assert!(!repo.contains("a").await.unwrap());

        let committed = repo.save_changes().await.unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].stream_id, "tally-a");
        assert!(!repo.tracked("a").unwrap().has_pending_events());
        assert_eq!(repo.load("a").await.unwrap().state().total, 1);
    }

    #[tokio::test]
    async fn snapshots_are_taken_and_used() {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let mut repo = repo()
            .with_snapshot_store(snapshots.clone())
            .with_options(RepositoryOptions {
                snapshot_policy: SnapshotPolicy::from_frequency(3),
            });

        repo.track(tally_with("1", &[1, 2])).unwrap();
        repo.save_changes().await.unwrap();
        assert!(snapshots.load("tally", "1").await.unwrap().is_none());

        repo.tracked_mut("1").unwrap().raise(Added { n: 3 }).unwrap();
        repo.save_changes().await.unwrap();
        let snapshot = snapshots.load("tally", "1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);

        repo.tracked_mut("1").unwrap().raise(Added { n: 4 }).unwrap();
        repo.save_changes().await.unwrap();

        let loaded = repo.load("1").await.unwrap();
        assert_eq!(loaded.state().total, 10);
        assert_eq!(loaded.version(), 4);
    }

    #[tokio::test]
    async fn undecodable_snapshots_fall_back_to_full_replay() {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repo = repo().with_snapshot_store(snapshots.clone());
        let mut root = tally_with("1", &[4, 5]);
        repo.add(&mut root).await.unwrap();

        snapshots
            .save(
                "tally",
                Snapshot {
                    aggregate_id: "1".into(),
                    version: 1,
                    state: serde_json::json!("garbage"),
                    taken_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(repo.load("1").await.unwrap().state().total, 9);
    }

    #[tokio::test]
    async fn historical_versions_and_removal() {
        let mut repo = repo();
        let mut root = tally_with("1", &[1, 2, 3]);
        repo.add(&mut root).await.unwrap();

        let at_one = repo.load_at_version("1", 1).await.unwrap();
        assert_eq!((at_one.state().total, at_one.version()), (3, 2));

        assert!(repo.remove("1").await.unwrap());
        assert!(!repo.remove("1").await.unwrap());
        assert_eq!(
            repo.load("1").await.unwrap_err(),
            RepositoryError::AggregateNotFound("1".into())
        );
    }

    #[tokio::test]
    async fn unknown_event_types_fail_loading() {
        let repo = repo();
        repo.store()
            .append(
                "tally-1",
                vec![EventDescriptor::of_type("tally-exploded")],
                ExpectedVersion::NoStream,
            )
            .await
            .unwrap();
        assert!(matches!(
            repo.load("1").await,
            Err(RepositoryError::UnsupportedEventMigration { offset: 0, .. })
        ));
    }
}
