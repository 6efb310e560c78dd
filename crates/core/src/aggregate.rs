//! Event-sourced aggregates: fold tables, aggregate state and the pending-event root.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::error::{DomainError, DomainResult};
use crate::event::{DomainEvent, EventDescriptor, EventRecord, StreamPosition};

/// Metadata key under which raised events record when they happened.
pub const OCCURRED_AT_KEY: &str = "occurredAt";

/// Optimistic concurrency expectation for an append.
///
/// `actual` values compared against an expectation are the stream's last assigned
/// offset, or `None` when the stream does not exist.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last offset must be exactly this value.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: Option<u64>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual.is_none(),
            ExpectedVersion::Exact(v) => actual == Some(v),
        }
    }

    /// Map the raw "optional int64" form (`None`, `-1`, `n >= 0`) onto the enum.
    pub fn from_raw(raw: Option<i64>) -> DomainResult<Self> {
        match raw {
            None => Ok(ExpectedVersion::Any),
            Some(StreamPosition::RAW_END_OF_STREAM) => Ok(ExpectedVersion::NoStream),
            Some(v) if v >= 0 => Ok(ExpectedVersion::Exact(v as u64)),
            Some(v) => Err(DomainError::validation(format!("invalid expected version {v}"))),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("no-stream"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

type FoldFn<A> = Box<dyn Fn(&mut A, &JsonValue) -> DomainResult<()> + Send + Sync>;

/// Per-aggregate-type dispatch table: event type tag -> fold function.
///
/// Built once per aggregate type (typically inside a `OnceLock`) and consulted for
/// both freshly raised events and replayed history, so both paths fold identically.
pub struct EventHandlers<A> {
    folds: HashMap<&'static str, FoldFn<A>>,
}

impl<A: 'static> EventHandlers<A> {
    pub fn new() -> Self {
        Self {
            folds: HashMap::new(),
        }
    }

    /// Register a typed fold function for `E::EVENT_TYPE`.
    pub fn on<E, F>(mut self, fold: F) -> Self
    where
        E: DomainEvent,
        F: Fn(&mut A, E) + Send + Sync + 'static,
    {
        self.folds.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut A, data: &JsonValue| {
                let event: E = serde_json::from_value(data.clone())
                    .map_err(|e| DomainError::decode(E::EVENT_TYPE, e))?;
                fold(state, event);
                Ok(())
            }),
        );
        self
    }

    /// Register an untyped fold function working on the raw payload.
    pub fn on_raw<F>(mut self, event_type: &'static str, fold: F) -> Self
    where
        F: Fn(&mut A, &JsonValue) -> DomainResult<()> + Send + Sync + 'static,
    {
        self.folds.insert(event_type, Box::new(fold));
        self
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.folds.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.folds.keys().copied()
    }

    /// Fold one event into `state`.
    pub fn fold(
        &self,
        aggregate_type: &str,
        state: &mut A,
        event_type: &str,
        data: Option<&JsonValue>,
    ) -> DomainResult<()> {
        let fold = self
            .folds
            .get(event_type)
            .ok_or_else(|| DomainError::unhandled(aggregate_type, event_type))?;
        match data {
            Some(data) => fold(state, data),
            None => fold(state, &JsonValue::Null),
        }
    }
}

impl<A: 'static> Default for EventHandlers<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for EventHandlers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("event_types", &self.folds.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// An event-sourced aggregate type.
///
/// Aggregates are plain data; every state transition goes through the fold table
/// returned by [`Aggregate::handlers`]. Implementations keep the table in a static:
///
/// ```ignore
/// impl Aggregate for User {
///     const AGGREGATE_TYPE: &'static str = "user";
///
///     fn handlers() -> &'static EventHandlers<Self> {
///         static HANDLERS: OnceLock<EventHandlers<User>> = OnceLock::new();
///         HANDLERS.get_or_init(|| EventHandlers::new().on(User::on_created))
///     }
/// }
/// ```
pub trait Aggregate:
    Default + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stream prefix for instances of this aggregate (`"{AGGREGATE_TYPE}-{id}"`).
    const AGGREGATE_TYPE: &'static str;

    fn handlers() -> &'static EventHandlers<Self>;
}

/// Aggregate state plus the bookkeeping fields every aggregate carries.
///
/// `state_version` is the offset the next committed event will get, i.e. the last
/// folded offset plus one (and the number of folded events when nothing was truncated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState<A> {
    pub id: String,
    pub state_version: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub data: A,
}

impl<A: Default> AggregateState<A> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state_version: 0,
            created_at: None,
            last_modified: None,
            data: A::default(),
        }
    }
}

/// Owns one aggregate's state and the events raised against it but not yet committed.
///
/// The pending list stays readable until [`AggregateRoot::mark_committed`] drains it,
/// which the repository does only after the append succeeded.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    state: AggregateState<A>,
    pending: Vec<EventDescriptor>,
}

impl<A: Aggregate> AggregateRoot<A> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            state: AggregateState::new(id),
            pending: Vec::new(),
        }
    }

    pub fn from_state(state: AggregateState<A>) -> Self {
        Self {
            state,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Committed version (see [`AggregateState::state_version`]).
    pub fn version(&self) -> u64 {
        self.state.state_version
    }

    pub fn state(&self) -> &A {
        &self.state.data
    }

    pub fn aggregate_state(&self) -> &AggregateState<A> {
        &self.state
    }

    pub fn into_state(self) -> AggregateState<A> {
        self.state
    }

    pub fn pending_events(&self) -> &[EventDescriptor] {
        &self.pending
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Expected version for committing the pending events.
    pub fn expected_version(&self) -> ExpectedVersion {
        match self.state.state_version {
            0 => ExpectedVersion::NoStream,
            v => ExpectedVersion::Exact(v - 1),
        }
    }

    /// Fold a new event into the state and queue it for commit.
    pub fn raise<E: DomainEvent>(&mut self, event: E) -> DomainResult<()> {
        let now = Utc::now();
        let descriptor =
            EventDescriptor::from_event(&event)?.with_metadata(json!({ OCCURRED_AT_KEY: now }));

        A::handlers().fold(
            A::AGGREGATE_TYPE,
            &mut self.state.data,
            E::EVENT_TYPE,
            descriptor.data.as_ref(),
        )?;
        self.touch(now);
        self.pending.push(descriptor);
        Ok(())
    }

    /// Fold an already committed record (history replay).
    pub fn apply_committed(&mut self, record: &EventRecord) -> DomainResult<()> {
        if self.has_pending_events() {
            return Err(DomainError::invariant(format!(
                "cannot replay committed events into '{}' while it has pending events",
                self.state.id
            )));
        }
        if record.offset < self.state.state_version {
            return Err(DomainError::invariant(format!(
                "event offset {} already folded into '{}' (version {})",
                record.offset, self.state.id, self.state.state_version
            )));
        }

        A::handlers().fold(
            A::AGGREGATE_TYPE,
            &mut self.state.data,
            &record.event_type,
            record.data.as_ref(),
        )?;
        self.touch(occurred_at(record));
        self.state.state_version = record.offset + 1;
        Ok(())
    }

    /// Acknowledge a successful commit: bumps the version and drains the pending list.
    pub fn mark_committed(&mut self) -> Vec<EventDescriptor> {
        self.state.state_version += self.pending.len() as u64;
        std::mem::take(&mut self.pending)
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if self.state.created_at.is_none() {
            self.state.created_at = Some(at);
        }
        self.state.last_modified = Some(at);
    }
}

fn occurred_at(record: &EventRecord) -> DateTime<Utc> {
    record
        .metadata
        .as_ref()
        .and_then(|m| m.get(OCCURRED_AT_KEY))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(record.timestamp)
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        total: i64,
        resets: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Incremented {
        by: i64,
    }

    impl DomainEvent for Incremented {
        const EVENT_TYPE: &'static str = "counter-incremented";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Reset;

    impl DomainEvent for Reset {
        const EVENT_TYPE: &'static str = "counter-reset";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unknown;

    impl DomainEvent for Unknown {
        const EVENT_TYPE: &'static str = "counter-exploded";
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "counter";

        fn handlers() -> &'static EventHandlers<Self> {
            static HANDLERS: OnceLock<EventHandlers<Counter>> = OnceLock::new();
            HANDLERS.get_or_init(|| {
                EventHandlers::new()
                    .on(|c: &mut Counter, e: Incremented| c.total += e.by)
                    .on(|c: &mut Counter, _: Reset| {
                        c.total = 0;
                        c.resets += 1;
                    })
            })
        }
    }

    fn committed(root: &AggregateRoot<Counter>, offset: u64) -> EventRecord {
        let d = &root.pending_events()[offset as usize];
        EventRecord {
            id: format!("e{offset}"),
            stream_id: "counter-1".to_string(),
            offset,
            timestamp: Utc::now(),
            event_type: d.event_type.clone(),
            data: d.data.clone(),
            metadata: d.metadata.clone(),
        }
    }

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(4)));
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(0)));
        assert!(ExpectedVersion::Exact(1).matches(Some(1)));
        assert!(!ExpectedVersion::Exact(0).matches(Some(1)));
        assert!(!ExpectedVersion::Exact(0).matches(None));
    }

    #[test]
    fn expected_version_from_raw_sentinels() {
        assert_eq!(ExpectedVersion::from_raw(None).unwrap(), ExpectedVersion::Any);
        assert_eq!(ExpectedVersion::from_raw(Some(-1)).unwrap(), ExpectedVersion::NoStream);
        assert_eq!(ExpectedVersion::from_raw(Some(0)).unwrap(), ExpectedVersion::Exact(0));
        assert!(ExpectedVersion::from_raw(Some(-5)).is_err());
    }

    #[test]
    fn raise_folds_and_queues() {
        let mut root = AggregateRoot::<Counter>::new("1");
        root.raise(Incremented { by: 2 }).unwrap();
        root.raise(Incremented { by: 3 }).unwrap();

        assert_eq!(root.state().total, 5);
        assert_eq!(root.pending_events().len(), 2);
        assert_eq!(root.version(), 0);
        assert_eq!(root.expected_version(), ExpectedVersion::NoStream);
        assert!(root.aggregate_state().created_at.is_some());
    }

    #[test]
    fn unhandled_event_is_rejected_without_queueing() {
        let mut root = AggregateRoot::<Counter>::new("1");
        let err = root.raise(Unknown).unwrap_err();
        assert!(matches!(err, DomainError::UnhandledEvent { .. }));
        assert!(!root.has_pending_events());
    }

    #[test]
    fn mark_committed_bumps_version() {
        let mut root = AggregateRoot::<Counter>::new("1");
        root.raise(Incremented { by: 1 }).unwrap();
        root.raise(Reset).unwrap();
        let drained = root.mark_committed();

        assert_eq!(drained.len(), 2);
        assert_eq!(root.version(), 2);
        assert_eq!(root.expected_version(), ExpectedVersion::Exact(1));
        assert!(!root.has_pending_events());
    }

    #[test]
    fn replay_reproduces_raised_state() {
        let mut live = AggregateRoot::<Counter>::new("1");
        live.raise(Incremented { by: 4 }).unwrap();
        live.raise(Reset).unwrap();
        live.raise(Incremented { by: 9 }).unwrap();
        let records: Vec<_> = (0..3).map(|o| committed(&live, o)).collect();
        live.mark_committed();

        let mut replayed = AggregateRoot::<Counter>::new("1");
        for r in &records {
            replayed.apply_committed(r).unwrap();
        }

        assert_eq!(replayed.aggregate_state(), live.aggregate_state());
    }

    #[test]
    fn replay_rejects_already_folded_offsets() {
        let mut live = AggregateRoot::<Counter>::new("1");
        live.raise(Incremented { by: 1 }).unwrap();
        let record = committed(&live, 0);

        let mut replayed = AggregateRoot::<Counter>::new("1");
        replayed.apply_committed(&record).unwrap();
        assert!(replayed.apply_committed(&record).is_err());
    }
}
