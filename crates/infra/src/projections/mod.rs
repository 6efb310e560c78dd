//! Projection manager (continuously materialized read state).
//!
//! Projections consume source streams and fold them into derived state.
//! All projections are:
//! - **Rebuildable**: state can be reconstructed from the source streams
//! - **Resumable**: state and per-source cursors are persisted after every event
//! - **Idempotent**: records at or before a source's cursor are ignored

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use streamfold_events::ProjectionError;

use crate::event_store::EventStoreError;
use crate::subscriptions::RetryPolicy;

pub mod manager;
pub mod state_store;

pub use manager::ProjectionManager;
pub use state_store::{
    EventStoreProjectionStateStore, InMemoryProjectionStateStore, ProjectionStateStore,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectionManagerError {
    #[error("projection '{0}' already exists")]
    AlreadyExists(String),

    #[error("projection '{0}' not found")]
    NotFound(String),

    #[error("invalid projection name '{0}'")]
    InvalidName(String),

    #[error("state of projection '{name}' could not be decoded: {reason}")]
    StateDecode { name: String, reason: String },

    #[error(transparent)]
    Definition(#[from] ProjectionError),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// What a projection persists so it can resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProjection {
    pub state: JsonValue,
    /// Last processed offset per source stream.
    pub cursors: BTreeMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionManagerOptions {
    /// Backoff between attempts to (re)subscribe to a failing source.
    pub retry: RetryPolicy,
    /// How often a source stream that does not exist yet is checked for.
    pub poll_interval: Duration,
    /// Deliveries buffered per source subscription.
    pub buffer: usize,
}

impl Default for ProjectionManagerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(30),
                max_attempts: None,
            },
            poll_interval: Duration::from_millis(500),
            buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub stream_id: String,
    /// Last processed offset, `None` until the first event was processed.
    pub cursor: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionStatus {
    pub name: String,
    pub running: bool,
    pub sources: Vec<SourceStatus>,
    pub updated_at: Option<DateTime<Utc>>,
}
