use std::fmt;
use std::sync::Arc;

use streamfold_core::{EventDescriptor, EventRecord};

use crate::runner::ProjectionError;

type GivenFn<T> = Arc<dyn Fn() -> T + Send + Sync>;
type WhenFn<T> = Arc<dyn Fn(&T, &EventRecord) -> bool + Send + Sync>;
type ThenFn<T> = Arc<dyn Fn(&mut T, &EventRecord, &mut ProjectionEffects) + Send + Sync>;

/// A projection folds events from one or more source streams into derived state.
///
/// Projections implement the **read model** side of the engine: the source streams are
/// the truth, and the state built here is a disposable, rebuildable view.
///
/// ## Definition
///
/// A definition is assembled with [`ProjectionBuilder`]:
///
/// - **Sources**: the streams the projection follows (at least one)
/// - **Given**: a factory for the seed state
/// - **When**: predicates over `(state, event)`; an event is processed only if all of
///   them accept it
/// - **Then**: folds over `(state, event)`, run in registration order, which may also
///   request side effects such as linking the event into another stream
///
/// ```ignore
/// let definition = ProjectionDefinition::<u64>::builder()
///     .from_stream("user-1")
///     .given(|| 0)
///     .when(|_, e| e.event_type == "user-logged-in")
///     .then(|count, e, effects| {
///         *count += 1;
///         effects.link_to("logins", e);
///     })
///     .build()?;
/// ```
///
/// ## Ordering
///
/// Events of one source arrive in offset order. Ordering *across* sources is not
/// defined, so `Then` functions should not depend on it.
///
/// ## Side effects
///
/// `Then` functions never perform IO themselves. They record intent in
/// [`ProjectionEffects`], and whoever drives the projection carries the effects out
/// after the state change was recorded.
pub struct ProjectionDefinition<T> {
    sources: Vec<String>,
    given: GivenFn<T>,
    when: Vec<WhenFn<T>>,
    then: Vec<ThenFn<T>>,
}

impl<T> Clone for ProjectionDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            sources: self.sources.clone(),
            given: Arc::clone(&self.given),
            when: self.when.clone(),
            then: self.then.clone(),
        }
    }
}

impl<T> fmt::Debug for ProjectionDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionDefinition")
            .field("sources", &self.sources)
            .field("when", &self.when.len())
            .field("then", &self.then.len())
            .finish()
    }
}

impl<T> ProjectionDefinition<T> {
    pub fn builder() -> ProjectionBuilder<T> {
        ProjectionBuilder::new()
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn follows(&self, stream_id: &str) -> bool {
        self.sources.iter().any(|s| s == stream_id)
    }

    /// Fresh seed state.
    pub fn seed(&self) -> T {
        (self.given)()
    }

    pub fn matches(&self, state: &T, event: &EventRecord) -> bool {
        self.when.iter().all(|when| when(state, event))
    }

    pub fn apply(&self, state: &mut T, event: &EventRecord, effects: &mut ProjectionEffects) {
        for then in &self.then {
            then(state, event, effects);
        }
    }
}

/// Builder for [`ProjectionDefinition`].
pub struct ProjectionBuilder<T> {
    sources: Vec<String>,
    given: Option<GivenFn<T>>,
    when: Vec<WhenFn<T>>,
    then: Vec<ThenFn<T>>,
}

impl<T> ProjectionBuilder<T> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            given: None,
            when: Vec::new(),
            then: Vec::new(),
        }
    }

    pub fn from_stream(mut self, stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        if !self.sources.contains(&stream_id) {
            self.sources.push(stream_id);
        }
        self
    }

    pub fn from_streams<I, S>(self, stream_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        stream_ids
            .into_iter()
            .fold(self, |builder, stream_id| builder.from_stream(stream_id))
    }

    pub fn given(mut self, seed: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.given = Some(Arc::new(seed));
        self
    }

    pub fn when(mut self, predicate: impl Fn(&T, &EventRecord) -> bool + Send + Sync + 'static) -> Self {
        self.when.push(Arc::new(predicate));
        self
    }

    pub fn then(
        mut self,
        fold: impl Fn(&mut T, &EventRecord, &mut ProjectionEffects) + Send + Sync + 'static,
    ) -> Self {
        self.then.push(Arc::new(fold));
        self
    }

    pub fn build(self) -> Result<ProjectionDefinition<T>, ProjectionError> {
        if self.sources.is_empty() {
            return Err(ProjectionError::NoSources);
        }
        let given = self.given.ok_or(ProjectionError::MissingSeed)?;
        Ok(ProjectionDefinition {
            sources: self.sources,
            given,
            when: self.when,
            then: self.then,
        })
    }
}

impl<T> Default for ProjectionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A side effect requested by a `Then` function.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionEffect {
    /// Append a link to `record` onto `stream_id`.
    LinkTo { stream_id: String, record: EventRecord },
    /// Append a new event onto `stream_id`.
    Emit { stream_id: String, event: EventDescriptor },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionEffects {
    effects: Vec<ProjectionEffect>,
}

impl ProjectionEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_to(&mut self, stream_id: impl Into<String>, record: &EventRecord) {
        self.effects.push(ProjectionEffect::LinkTo {
            stream_id: stream_id.into(),
            record: record.clone(),
        });
    }

    pub fn emit(&mut self, stream_id: impl Into<String>, event: EventDescriptor) {
        self.effects.push(ProjectionEffect::Emit {
            stream_id: stream_id.into(),
            event,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectionEffect> {
        self.effects.iter()
    }
}

impl IntoIterator for ProjectionEffects {
    type Item = ProjectionEffect;
    type IntoIter = std::vec::IntoIter<ProjectionEffect>;

    fn into_iter(self) -> Self::IntoIter {
        self.effects.into_iter()
    }
}
