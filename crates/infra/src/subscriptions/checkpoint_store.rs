//! Durable subscription checkpoint persistence.
//!
//! A checkpoint is the highest offset up to which a durable group has every event
//! acknowledged. Persisting it enables:
//! - Resume after reconnect or restart (delivery continues after the checkpoint)
//! - Bounded redelivery (only unacknowledged events past the checkpoint are resent)
//! - Resetting a group (clear the checkpoint and start over)

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::json;
use tokio_stream::StreamExt;

use streamfold_core::{EventDescriptor, ExpectedVersion, StreamPosition, StreamReadDirection};

use crate::event_store::{EventStore, EventStoreError};

/// Event type of checkpoint records written by [`EventStoreCheckpointStore`].
pub const CHECKPOINT_EVENT_TYPE: &str = "$checkpoint";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted checkpoint of `group` on `stream_id`.
    async fn load(&self, group: &str, stream_id: &str) -> Result<Option<u64>, EventStoreError>;

    async fn save(&self, group: &str, stream_id: &str, offset: u64) -> Result<(), EventStoreError>;

    async fn clear(&self, group: &str, stream_id: &str) -> Result<(), EventStoreError>;
}

/// In-memory checkpoint store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<(String, String), u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Storage("checkpoint lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, group: &str, stream_id: &str) -> Result<Option<u64>, EventStoreError> {
        let map = self.checkpoints.read().map_err(|_| poisoned())?;
        Ok(map.get(&(group.to_string(), stream_id.to_string())).copied())
    }

    async fn save(&self, group: &str, stream_id: &str, offset: u64) -> Result<(), EventStoreError> {
        let mut map = self.checkpoints.write().map_err(|_| poisoned())?;
        map.insert((group.to_string(), stream_id.to_string()), offset);
        Ok(())
    }

    async fn clear(&self, group: &str, stream_id: &str) -> Result<(), EventStoreError> {
        let mut map = self.checkpoints.write().map_err(|_| poisoned())?;
        map.remove(&(group.to_string(), stream_id.to_string()));
        Ok(())
    }
}

/// Keeps checkpoints as events in a dedicated stream of the event store itself.
///
/// Each save appends one `$checkpoint` record to `$checkpoints-{group}-{stream_id}`
/// and truncates the older ones away; loading reads the stream backwards.
#[derive(Debug, Clone)]
pub struct EventStoreCheckpointStore<S> {
    store: S,
}

impl<S> EventStoreCheckpointStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn checkpoint_stream(group: &str, stream_id: &str) -> String {
        format!("$checkpoints-{group}-{stream_id}")
    }
}

#[async_trait]
impl<S> CheckpointStore for EventStoreCheckpointStore<S>
where
    S: EventStore,
{
    async fn load(&self, group: &str, stream_id: &str) -> Result<Option<u64>, EventStoreError> {
        let stream = Self::checkpoint_stream(group, stream_id);
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
        record
            .data
            .as_ref()
            .and_then(|d| d.get("offset"))
            .and_then(|o| o.as_u64())
            .map(Some)
            .ok_or_else(|| {
                EventStoreError::Serialization(format!(
                    "checkpoint record {} of '{stream}' has no offset",
                    record.offset
                ))
            })
    }

    async fn save(&self, group: &str, stream_id: &str, offset: u64) -> Result<(), EventStoreError> {
        let stream = Self::checkpoint_stream(group, stream_id);
        let committed = self
            .store
            .append(
                &stream,
                vec![EventDescriptor::new(CHECKPOINT_EVENT_TYPE, json!({ "offset": offset }))],
                ExpectedVersion::Any,
            )
            .await?;
        if let Some(record) = committed.last() {
            self.store.truncate(&stream, Some(record.offset)).await?;
        }
        Ok(())
    }

    async fn clear(&self, group: &str, stream_id: &str) -> Result<(), EventStoreError> {
        match self.store.delete(&Self::checkpoint_stream(group, stream_id)).await {
            Ok(()) | Err(EventStoreError::StreamNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
