//! Projection state persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_stream::StreamExt;

use streamfold_core::{EventDescriptor, ExpectedVersion, StreamPosition, StreamReadDirection};

use crate::event_store::{EventStore, EventStoreError};

use super::PersistedProjection;

/// Event type of state records written by [`EventStoreProjectionStateStore`].
pub const PROJECTION_STATE_EVENT_TYPE: &str = "$projection-state";

#[async_trait]
pub trait ProjectionStateStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<PersistedProjection>, EventStoreError>;

    async fn save(&self, name: &str, projection: &PersistedProjection) -> Result<(), EventStoreError>;

    async fn delete(&self, name: &str) -> Result<(), EventStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProjectionStateStore {
    projections: RwLock<HashMap<String, PersistedProjection>>,
}

impl InMemoryProjectionStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Storage("projection state lock poisoned".to_string())
}

#[async_trait]
impl ProjectionStateStore for InMemoryProjectionStateStore {
    async fn load(&self, name: &str) -> Result<Option<PersistedProjection>, EventStoreError> {
        let map = self.projections.read().map_err(|_| poisoned())?;
        Ok(map.get(name).cloned())
    }

    async fn save(&self, name: &str, projection: &PersistedProjection) -> Result<(), EventStoreError> {
        let mut map = self.projections.write().map_err(|_| poisoned())?;
        map.insert(name.to_string(), projection.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), EventStoreError> {
        let mut map = self.projections.write().map_err(|_| poisoned())?;
        map.remove(name);
        Ok(())
    }
}

/// Keeps projection state in the event store, one stream per projection
/// (`"$projections-{name}"`) holding only the latest state record.
#[derive(Debug, Clone)]
pub struct EventStoreProjectionStateStore<S> {
    store: S,
}

impl<S> EventStoreProjectionStateStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn state_stream(name: &str) -> String {
        format!("$projections-{name}")
    }
}

#[async_trait]
impl<S> ProjectionStateStore for EventStoreProjectionStateStore<S>
where
    S: EventStore,
{
    async fn load(&self, name: &str) -> Result<Option<PersistedProjection>, EventStoreError> {
        let mut latest = match self
            .store
            .read(
                &Self::state_stream(name),
                StreamReadDirection::Backwards,
                StreamPosition::EndOfStream,
                Some(1),
            )
            .await
        {
            Ok(latest) => latest,
            Err(EventStoreError::StreamNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match latest.next().await.transpose()? {
            Some(record) => Ok(Some(serde_json::from_value(
                record.data.unwrap_or(JsonValue::Null),
            )?)),
            None => Ok(None),
        }
    }

    async fn save(&self, name: &str, projection: &PersistedProjection) -> Result<(), EventStoreError> {
        let stream = Self::state_stream(name);
        let committed = self
            .store
            .append(
                &stream,
                vec![EventDescriptor::new(
                    PROJECTION_STATE_EVENT_TYPE,
                    serde_json::to_value(projection)?,
                )],
                ExpectedVersion::Any,
            )
            .await?;
        if let Some(record) = committed.last() {
            self.store.truncate(&stream, Some(record.offset)).await?;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), EventStoreError> {
        match self.store.delete(&Self::state_stream(name)).await {
            Ok(()) | Err(EventStoreError::StreamNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
