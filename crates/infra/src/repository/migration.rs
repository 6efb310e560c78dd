//! Event schema migration (upcasting).
//!
//! Each registered step rewrites one superseded event type into its successor.
//! Loading follows the chain (`v1 -> v2 -> v3`) until the aggregate's handler table
//! accepts the type, so fold functions only ever see current shapes.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::Value as JsonValue;

use streamfold_core::{Aggregate, DomainError, DomainEvent, DomainResult, EventRecord};

use super::RepositoryError;

type MigrateFn = Box<dyn Fn(Option<JsonValue>) -> DomainResult<Option<JsonValue>> + Send + Sync>;

struct MigrationStep {
    to_type: String,
    migrate: MigrateFn,
}

/// Registered upcasters, keyed by the event type they migrate from.
#[derive(Default)]
pub struct EventMigrations {
    steps: HashMap<String, MigrationStep>,
}

impl EventMigrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed upcaster from `Old` to `New`.
    pub fn register<Old, New, F>(self, migrate: F) -> Self
    where
        Old: DomainEvent,
        New: DomainEvent,
        F: Fn(Old) -> New + Send + Sync + 'static,
    {
        self.register_raw(Old::EVENT_TYPE, New::EVENT_TYPE, move |data| {
            let old: Old = serde_json::from_value(data.unwrap_or(JsonValue::Null))
                .map_err(|e| DomainError::decode(Old::EVENT_TYPE, e))?;
            serde_json::to_value(migrate(old))
                .map(Some)
                .map_err(|e| DomainError::encode(New::EVENT_TYPE, e))
        })
    }

    /// Register an upcaster working on raw payloads.
    ///
    /// Registering the same `from_type` twice replaces the earlier step.
    pub fn register_raw<F>(
        mut self,
        from_type: impl Into<String>,
        to_type: impl Into<String>,
        migrate: F,
    ) -> Self
    where
        F: Fn(Option<JsonValue>) -> DomainResult<Option<JsonValue>> + Send + Sync + 'static,
    {
        self.steps.insert(
            from_type.into(),
            MigrationStep {
                to_type: to_type.into(),
                migrate: Box::new(migrate),
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Bring `record` to a type `A` can fold.
    ///
    /// Records `A` already handles pass through untouched. Any other type must reach a
    /// handled type through registered steps; a missing step or a cycle fails with
    /// `UnsupportedEventMigration`.
    pub fn upcast<A: Aggregate>(&self, mut record: EventRecord) -> Result<EventRecord, RepositoryError> {
        let handlers = A::handlers();
        if handlers.handles(&record.event_type) {
            return Ok(record);
        }

        let original_type = record.event_type.clone();
        let unsupported = |record: &EventRecord| RepositoryError::UnsupportedEventMigration {
            stream_id: record.stream_id.clone(),
            offset: record.offset,
            event_type: original_type.clone(),
        };

        let mut visited = HashSet::new();
        while !handlers.handles(&record.event_type) {
            let Some(step) = self.steps.get(&record.event_type) else {
                return Err(unsupported(&record));
            };
            if !visited.insert(record.event_type.clone()) {
                return Err(unsupported(&record));
            }
            record.data = (step.migrate)(record.data.take())?;
            record.event_type = step.to_type.clone();
        }
        Ok(record)
    }
}

impl fmt::Debug for EventMigrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<_> = self
            .steps
            .iter()
            .map(|(from, step)| format!("{from} -> {}", step.to_type))
            .collect();
        steps.sort();
        f.debug_struct("EventMigrations").field("steps", &steps).finish()
    }
}
