use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use streamfold_core::{EventDescriptor, EventRecord, ExpectedVersion, StreamPosition};
use streamfold_events::{
    ApplyOutcome, CancellationSignal, ProjectionDefinition, ProjectionEffect, ProjectionError,
    ProjectionRunner,
};

use crate::event_store::{EventStore, EventStoreError};
use crate::subscriptions::{CatchUpTransport, Subscription, SubscriptionError};

use super::state_store::{InMemoryProjectionStateStore, ProjectionStateStore};
use super::{
    PersistedProjection, ProjectionManagerError, ProjectionManagerOptions, ProjectionStatus,
    SourceStatus,
};

/// Object-safe view of a `ProjectionRunner<T>`, so projections with different state
/// types can live in one registry.
trait ErasedRunner: Send {
    fn apply(&mut self, record: &EventRecord) -> Result<ApplyOutcome, ProjectionError>;
    fn cursor(&self, stream_id: &str) -> Option<u64>;
    fn cursors(&self) -> BTreeMap<String, u64>;
    fn forget_cursor(&mut self, stream_id: &str) -> Option<u64>;
    fn state_json(&self) -> Result<JsonValue, serde_json::Error>;
}

impl<T> ErasedRunner for ProjectionRunner<T>
where
    T: Serialize + Send,
{
    fn apply(&mut self, record: &EventRecord) -> Result<ApplyOutcome, ProjectionError> {
        ProjectionRunner::apply(self, record)
    }

    fn cursor(&self, stream_id: &str) -> Option<u64> {
        ProjectionRunner::cursor(self, stream_id)
    }

    fn cursors(&self) -> BTreeMap<String, u64> {
        ProjectionRunner::cursors(self).clone()
    }

    fn forget_cursor(&mut self, stream_id: &str) -> Option<u64> {
        ProjectionRunner::forget_cursor(self, stream_id)
    }

    fn state_json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self.state())
    }
}

struct Shared {
    runner: Box<dyn ErasedRunner>,
    updated_at: Option<DateTime<Utc>>,
}

type SharedRunner = Arc<tokio::sync::Mutex<Shared>>;

struct RunningProjection {
    sources: Vec<String>,
    shared: SharedRunner,
    cancel: CancellationSignal,
    tasks: Vec<JoinHandle<()>>,
}

/// Runs projections in the background and answers queries about their state.
///
/// Each source stream of a projection is followed by its own task through a catch-up
/// subscription starting after the source's cursor. State and cursors are shared by
/// the source tasks behind one async mutex and persisted after every processed event,
/// so a projection created again after a restart resumes where it stopped.
pub struct ProjectionManager<S> {
    store: S,
    states: Arc<dyn ProjectionStateStore>,
    options: ProjectionManagerOptions,
    running: Mutex<HashMap<String, RunningProjection>>,
}

impl<S> ProjectionManager<S>
where
    S: EventStore + Clone + 'static,
{
    /// Manager persisting projection state in memory.
    pub fn new(store: S) -> Self {
        Self::with_state_store(store, Arc::new(InMemoryProjectionStateStore::new()))
    }

    pub fn with_state_store(store: S, states: Arc<dyn ProjectionStateStore>) -> Self {
        Self {
            store,
            states,
            options: ProjectionManagerOptions::default(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_options(mut self, options: ProjectionManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Start a projection.
    ///
    /// Fails with `AlreadyExists` while a projection of that name runs. State persisted
    /// by an earlier run of the same name is picked up, cursors included.
    #[instrument(skip(self, definition), fields(sources = definition.sources().len()))]
    pub async fn create<T>(&self, name: &str, definition: ProjectionDefinition<T>) -> Result<(), ProjectionManagerError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        if name.trim().is_empty() {
            return Err(ProjectionManagerError::InvalidName(name.to_string()));
        }
        if self.is_running(name)? {
            return Err(ProjectionManagerError::AlreadyExists(name.to_string()));
        }

        let (runner, updated_at) = match self.states.load(name).await? {
            Some(persisted) => {
                let state: T = serde_json::from_value(persisted.state).map_err(|e| {
                    ProjectionManagerError::StateDecode {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                debug!(name, cursors = ?persisted.cursors, "resuming persisted projection");
                (
                    ProjectionRunner::restore(definition, state, persisted.cursors),
                    Some(persisted.updated_at),
                )
            }
            None => (ProjectionRunner::new(definition), None),
        };
        let sources = runner.definition().sources().to_vec();
        let shared: SharedRunner = Arc::new(tokio::sync::Mutex::new(Shared {
            runner: Box::new(runner),
            updated_at,
        }));

        let mut running = self.running.lock().map_err(|_| poisoned())?;
        if running.contains_key(name) {
            return Err(ProjectionManagerError::AlreadyExists(name.to_string()));
        }

        let cancel = CancellationSignal::new();
        let tasks = sources
            .iter()
            .map(|stream_id| {
                let worker = SourceWorker {
                    projection: name.to_string(),
                    stream_id: stream_id.clone(),
                    store: self.store.clone(),
                    states: Arc::clone(&self.states),
                    shared: Arc::clone(&shared),
                    cancel: cancel.clone(),
                    options: self.options.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        running.insert(
            name.to_string(),
            RunningProjection {
                sources: sources.clone(),
                shared,
                cancel,
                tasks,
            },
        );
        info!(name, ?sources, "projection created");
        Ok(())
    }

    /// Current state of `name`.
    ///
    /// Eventually consistent: an event appended to a source moments ago may not be
    /// reflected yet. A stopped projection answers from its persisted state.
    pub async fn get_state<T>(&self, name: &str) -> Result<T, ProjectionManagerError>
    where
        T: DeserializeOwned,
    {
        let state = match self.shared(name)? {
            Some(shared) => {
                let shared = shared.lock().await;
                shared
                    .runner
                    .state_json()
                    .map_err(|e| ProjectionManagerError::StateDecode {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?
            }
            None => {
                self.states
                    .load(name)
                    .await?
                    .ok_or_else(|| ProjectionManagerError::NotFound(name.to_string()))?
                    .state
            }
        };

        serde_json::from_value(state).map_err(|e| ProjectionManagerError::StateDecode {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn status(&self, name: &str) -> Result<ProjectionStatus, ProjectionManagerError> {
        let running = {
            let running = self.running.lock().map_err(|_| poisoned())?;
            running
                .get(name)
                .map(|p| (p.sources.clone(), Arc::clone(&p.shared)))
        };

        match running {
            Some((sources, shared)) => {
                let shared = shared.lock().await;
                let sources = sources
                    .into_iter()
                    .map(|stream_id| SourceStatus {
                        cursor: shared.runner.cursor(&stream_id),
                        stream_id,
                    })
                    .collect();
                Ok(ProjectionStatus {
                    name: name.to_string(),
                    running: true,
                    sources,
                    updated_at: shared.updated_at,
                })
            }
            None => {
                let persisted = self
                    .states
                    .load(name)
                    .await?
                    .ok_or_else(|| ProjectionManagerError::NotFound(name.to_string()))?;
                Ok(ProjectionStatus {
                    name: name.to_string(),
                    running: false,
                    sources: persisted
                        .cursors
                        .into_iter()
                        .map(|(stream_id, cursor)| SourceStatus {
                            stream_id,
                            cursor: Some(cursor),
                        })
                        .collect(),
                    updated_at: Some(persisted.updated_at),
                })
            }
        }
    }

    /// Names of the running projections, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.running.lock() {
            Ok(running) => running.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Stop a running projection; its persisted state is kept.
    pub async fn stop(&self, name: &str) -> Result<(), ProjectionManagerError> {
        let projection = {
            let mut running = self.running.lock().map_err(|_| poisoned())?;
            running.remove(name)
        }
        .ok_or_else(|| ProjectionManagerError::NotFound(name.to_string()))?;

        halt(name, projection).await;
        info!(name, "projection stopped");
        Ok(())
    }

    /// Stop a projection (if running) and forget its persisted state.
    pub async fn delete(&self, name: &str) -> Result<(), ProjectionManagerError> {
        match self.stop(name).await {
            Ok(()) | Err(ProjectionManagerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.states.delete(name).await?;
        info!(name, "projection deleted");
        Ok(())
    }

    /// Stop every running projection.
    pub async fn shutdown(&self) {
        let projections: Vec<(String, RunningProjection)> = match self.running.lock() {
            Ok(mut running) => running.drain().collect(),
            Err(_) => return,
        };
        for (name, projection) in projections {
            halt(&name, projection).await;
        }
    }

    fn is_running(&self, name: &str) -> Result<bool, ProjectionManagerError> {
        let running = self.running.lock().map_err(|_| poisoned())?;
        Ok(running.contains_key(name))
    }

    fn shared(&self, name: &str) -> Result<Option<SharedRunner>, ProjectionManagerError> {
        let running = self.running.lock().map_err(|_| poisoned())?;
        Ok(running.get(name).map(|p| Arc::clone(&p.shared)))
    }
}

async fn halt(name: &str, projection: RunningProjection) {
    projection.cancel.cancel();
    for task in projection.tasks {
        if let Err(err) = task.await {
            warn!(projection = name, error = %err, "projection task failed");
        }
    }
}

fn poisoned() -> ProjectionManagerError {
    ProjectionManagerError::Store(EventStoreError::Storage("projection registry lock poisoned".into()))
}

/// Follows one source stream of one projection.
struct SourceWorker<S> {
    projection: String,
    stream_id: String,
    store: S,
    states: Arc<dyn ProjectionStateStore>,
    shared: SharedRunner,
    cancel: CancellationSignal,
    options: ProjectionManagerOptions,
}

impl<S> SourceWorker<S>
where
    S: EventStore + Clone + 'static,
{
    async fn run(self) {
        let mut attempt = 0u32;
        while !self.cancel.is_cancelled() {
            let delay = match self.follow(&mut attempt).await {
                Ok(()) => break,
                Err(SubscriptionError::Store(EventStoreError::StreamNotFound(_))) => {
                    debug!(projection = %self.projection, stream_id = %self.stream_id, "source does not exist");
                    // A recreated stream starts over at offset 0.
                    self.forget_cursor().await;
                    self.options.poll_interval
                }
                Err(err) => {
                    attempt += 1;
                    let delay = self.options.retry.backoff(attempt);
                    warn!(
                        projection = %self.projection,
                        stream_id = %self.stream_id,
                        error = %err,
                        attempt,
                        "projection source failed, resubscribing"
                    );
                    delay
                }
            };
            if self.cancel.run(tokio::time::sleep(delay)).await.is_err() {
                break;
            }
        }
        debug!(projection = %self.projection, stream_id = %self.stream_id, "projection source stopped");
    }

    /// Follow the source from its cursor until cancelled (`Ok`) or the subscription
    /// fails (`Err`).
    async fn follow(&self, attempt: &mut u32) -> Result<(), SubscriptionError> {
        let last_offset = match self.store.get(&self.stream_id).await {
            Ok(descriptor) => descriptor.last_offset,
            Err(err) => return Err(err.into()),
        };
        let cursor = self.shared.lock().await.runner.cursor(&self.stream_id);
        let from = match (cursor, last_offset) {
            (Some(cursor), Some(last)) if last < cursor => {
                debug!(projection = %self.projection, stream_id = %self.stream_id, cursor, last, "source offsets regressed");
                self.forget_cursor().await;
                0
            }
            (Some(cursor), _) => cursor + 1,
            (None, _) => 0,
        };
        let transport = CatchUpTransport::new(
            self.store.clone(),
            self.stream_id.clone(),
            StreamPosition::Offset(from),
        );
        let mut subscription = Subscription::open(self.stream_id.clone(), Arc::new(transport), self.options.buffer);

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                delivery = subscription.next() => delivery,
            };
            match delivery {
                Some(Ok(delivered)) => {
                    *attempt = 0;
                    self.process(&delivered.event).await;
                }
                Some(Err(err)) => return Err(err),
                None => return Err(SubscriptionError::Disposed),
            }
        }
    }

    async fn forget_cursor(&self) {
        let mut shared = self.shared.lock().await;
        if let Some(cursor) = shared.runner.forget_cursor(&self.stream_id) {
            info!(projection = %self.projection, stream_id = %self.stream_id, cursor, "source cursor reset");
            if let Some(persisted) = self.snapshot(&shared) {
                if let Err(err) = self.states.save(&self.projection, &persisted).await {
                    warn!(projection = %self.projection, error = %err, "failed to persist projection state");
                }
            }
        }
    }

    async fn process(&self, record: &EventRecord) {
        let effects = {
            let mut shared = self.shared.lock().await;
            let effects = match shared.runner.apply(record) {
                Ok(ApplyOutcome::Applied(effects)) => effects,
                Ok(ApplyOutcome::Skipped) => Default::default(),
                Ok(ApplyOutcome::Duplicate) => return,
                Err(err) => {
                    warn!(projection = %self.projection, error = %err, "record rejected by projection");
                    return;
                }
            };
            shared.updated_at = Some(Utc::now());
            // Persisted under the lock: saves from different sources must not interleave.
            if let Some(persisted) = self.snapshot(&shared) {
                if let Err(err) = self.states.save(&self.projection, &persisted).await {
                    warn!(projection = %self.projection, error = %err, "failed to persist projection state");
                }
            }
            effects
        };

        for effect in effects {
            self.perform(effect).await;
        }
    }

    fn snapshot(&self, shared: &Shared) -> Option<PersistedProjection> {
        let state = match shared.runner.state_json() {
            Ok(state) => state,
            Err(err) => {
                warn!(projection = %self.projection, error = %err, "projection state is not serializable");
                return None;
            }
        };
        Some(PersistedProjection {
            state,
            cursors: shared.runner.cursors(),
            updated_at: shared.updated_at.unwrap_or_else(Utc::now),
        })
    }

    async fn perform(&self, effect: ProjectionEffect) {
        let (target, descriptor) = match effect {
            ProjectionEffect::LinkTo { stream_id, record } => (stream_id, EventDescriptor::link_to(&record)),
            ProjectionEffect::Emit { stream_id, event } => (stream_id, event),
        };
        match self
            .store
            .append(&target, vec![descriptor], ExpectedVersion::Any)
            .await
        {
            Ok(_) => debug!(projection = %self.projection, target = %target, "projection effect applied"),
            Err(err) => {
                warn!(projection = %self.projection, target = %target, error = %err, "projection effect failed")
            }
        }
    }
}
