//! Aggregate snapshots.
//!
//! A snapshot caches an aggregate's folded state at one offset so loading only
//! replays the tail after it. Snapshots are an optimization: the repository ignores
//! any snapshot it cannot use and falls back to a full replay.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_stream::StreamExt;

use streamfold_core::{EventDescriptor, ExpectedVersion, StreamPosition, StreamReadDirection};

use crate::event_store::{EventStore, EventStoreError};

/// Event type of snapshot records written by [`EventStoreSnapshotStore`].
pub const SNAPSHOT_EVENT_TYPE: &str = "snapshot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    pub aggregate_id: String,
    /// Offset of the last event folded into `state`.
    pub version: u64,
    pub state: T,
    pub taken_at: DateTime<Utc>,
}

/// Snapshot with its state still encoded.
pub type RawSnapshot = Snapshot<JsonValue>;

impl<T: Serialize> Snapshot<T> {
    pub fn encode(&self) -> Result<RawSnapshot, serde_json::Error> {
        Ok(Snapshot {
            aggregate_id: self.aggregate_id.clone(),
            version: self.version,
            state: serde_json::to_value(&self.state)?,
            taken_at: self.taken_at,
        })
    }
}

impl RawSnapshot {
    pub fn decode<T: serde::de::DeserializeOwned>(self) -> Result<Snapshot<T>, serde_json::Error> {
        Ok(Snapshot {
            aggregate_id: self.aggregate_id,
            version: self.version,
            state: serde_json::from_value(self.state)?,
            taken_at: self.taken_at,
        })
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot of one aggregate instance.
    async fn load(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Option<RawSnapshot>, EventStoreError>;

    async fn save(&self, aggregate_type: &str, snapshot: RawSnapshot) -> Result<(), EventStoreError>;

    async fn delete(&self, aggregate_type: &str, aggregate_id: &str) -> Result<(), EventStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<(String, String), RawSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Storage("snapshot lock poisoned".to_string())
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Option<RawSnapshot>, EventStoreError> {
        let map = self.snapshots.read().map_err(|_| poisoned())?;
        Ok(map
            .get(&(aggregate_type.to_string(), aggregate_id.to_string()))
            .cloned())
    }

    async fn save(&self, aggregate_type: &str, snapshot: RawSnapshot) -> Result<(), EventStoreError> {
        let mut map = self.snapshots.write().map_err(|_| poisoned())?;
        map.insert(
            (aggregate_type.to_string(), snapshot.aggregate_id.clone()),
            snapshot,
        );
        Ok(())
    }

    async fn delete(&self, aggregate_type: &str, aggregate_id: &str) -> Result<(), EventStoreError> {
        let mut map = self.snapshots.write().map_err(|_| poisoned())?;
        map.remove(&(aggregate_type.to_string(), aggregate_id.to_string()));
        Ok(())
    }
}

/// Keeps snapshots as `snapshot` events in `"{aggregate_type}-snapshots-{id}"`.
///
/// Only the latest snapshot is retained; older ones are truncated after each save.
#[derive(Debug, Clone)]
pub struct EventStoreSnapshotStore<S> {
    store: S,
}

impl<S> EventStoreSnapshotStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn snapshot_stream(aggregate_type: &str, aggregate_id: &str) -> String {
        format!("{aggregate_type}-snapshots-{aggregate_id}")
    }
}

#[async_trait]
impl<S> SnapshotStore for EventStoreSnapshotStore<S>
where
    S: EventStore,
{
    async fn load(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Option<RawSnapshot>, EventStoreError> {
        let stream = Self::snapshot_stream(aggregate_type, aggregate_id);
        let mut latest = match self
            .store
            .read(&stream, StreamReadDirection::Backwards, StreamPosition::EndOfStream, Some(1))
            .await
        {
            Ok(latest) => latest,
            Err(EventStoreError::StreamNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(record) = latest.next().await.transpose()? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_value(record.data.unwrap_or(JsonValue::Null))?;
        Ok(Some(snapshot))
    }

    async fn save(&self, aggregate_type: &str, snapshot: RawSnapshot) -> Result<(), EventStoreError> {
        let stream = Self::snapshot_stream(aggregate_type, &snapshot.aggregate_id);
        let data = serde_json::to_value(&snapshot)?;
        let committed = self
            .store
            .append(
                &stream,
                vec![EventDescriptor::new(SNAPSHOT_EVENT_TYPE, data)],
                ExpectedVersion::Any,
            )
            .await?;
        if let Some(record) = committed.last() {
            self.store.truncate(&stream, Some(record.offset)).await?;
        }
        Ok(())
    }

    async fn delete(&self, aggregate_type: &str, aggregate_id: &str) -> Result<(), EventStoreError> {
        match self
            .store
            .delete(&Self::snapshot_stream(aggregate_type, aggregate_id))
            .await
        {
            Ok(()) | Err(EventStoreError::StreamNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
