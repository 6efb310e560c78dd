//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic folding and per-source cursor tracking
//! without making storage assumptions.

use std::collections::BTreeMap;

use thiserror::Error;

use streamfold_core::EventRecord;

use crate::projection::{ProjectionDefinition, ProjectionEffects};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("a projection needs at least one source stream")]
    NoSources,

    #[error("a projection needs a seed state (given)")]
    MissingSeed,

    #[error("stream '{stream_id}' is not a source of this projection")]
    UnknownSource { stream_id: String },
}

/// What happened to a record handed to [`ProjectionRunner::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The `When` predicates accepted the event and `Then` ran.
    Applied(ProjectionEffects),
    /// The predicates rejected the event; only the cursor moved.
    Skipped,
    /// The offset was at or before the source's cursor; nothing changed.
    Duplicate,
}

/// Runs records through a projection definition and tracks progress per source.
#[derive(Debug)]
pub struct ProjectionRunner<T> {
    definition: ProjectionDefinition<T>,
    state: T,
    cursors: BTreeMap<String, u64>,
}

impl<T> ProjectionRunner<T> {
    pub fn new(definition: ProjectionDefinition<T>) -> Self {
        let state = definition.seed();
        Self {
            definition,
            state,
            cursors: BTreeMap::new(),
        }
    }

    /// Resume from previously persisted state and cursors.
    ///
    /// Cursors for streams that are no longer sources are dropped.
    pub fn restore(definition: ProjectionDefinition<T>, state: T, cursors: BTreeMap<String, u64>) -> Self {
        let cursors = cursors
            .into_iter()
            .filter(|(stream_id, _)| definition.follows(stream_id))
            .collect();
        Self {
            definition,
            state,
            cursors,
        }
    }

    pub fn definition(&self) -> &ProjectionDefinition<T> {
        &self.definition
    }

    pub fn state(&self) -> &T {
        &self.state
    }

    /// Last processed offset of `stream_id`, if any.
    pub fn cursor(&self, stream_id: &str) -> Option<u64> {
        self.cursors.get(stream_id).copied()
    }

    pub fn cursors(&self) -> &BTreeMap<String, u64> {
        &self.cursors
    }

    /// Apply a single record, skipping anything at or before its source's cursor.
    pub fn apply(&mut self, record: &EventRecord) -> Result<ApplyOutcome, ProjectionError> {
        if !self.definition.follows(&record.stream_id) {
            return Err(ProjectionError::UnknownSource {
                stream_id: record.stream_id.clone(),
            });
        }
        if let Some(last) = self.cursor(&record.stream_id) {
            if record.offset <= last {
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        let outcome = if self.definition.matches(&self.state, record) {
            let mut effects = ProjectionEffects::new();
            self.definition.apply(&mut self.state, record, &mut effects);
            ApplyOutcome::Applied(effects)
        } else {
            ApplyOutcome::Skipped
        };

        self.cursors.insert(record.stream_id.clone(), record.offset);
        Ok(outcome)
    }

    /// Forget the cursor of one source, so its next offset 0 is applied again.
    ///
    /// Used when the source stream was deleted and may be recreated from scratch.
    pub fn forget_cursor(&mut self, stream_id: &str) -> Option<u64> {
        self.cursors.remove(stream_id)
    }

    /// Throw away state and cursors (rebuild from scratch).
    pub fn reset(&mut self) {
        self.state = self.definition.seed();
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::projection::ProjectionEffect;

    fn record(stream_id: &str, offset: u64, event_type: &str) -> EventRecord {
        EventRecord {
            id: format!("{stream_id}-{offset}"),
            stream_id: stream_id.to_string(),
            offset,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data: Some(json!({ "n": offset })),
            metadata: None,
        }
    }

    fn login_counter() -> ProjectionDefinition<u64> {
        ProjectionDefinition::builder()
            .from_streams(["user-1", "user-2"])
            .given(|| 0)
            .when(|_, e| e.event_type == "user-logged-in")
            .then(|count, e, effects| {
                *count += 1;
                effects.link_to("logins", e);
            })
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_sources_and_seed() {
        let no_sources = ProjectionDefinition::<u64>::builder().given(|| 0).build();
        assert_eq!(no_sources.unwrap_err(), ProjectionError::NoSources);

        let no_seed = ProjectionDefinition::<u64>::builder().from_stream("s").build();
        assert_eq!(no_seed.unwrap_err(), ProjectionError::MissingSeed);
    }

    #[test]
    fn folds_matching_events_and_collects_effects() {
        let mut runner = ProjectionRunner::new(login_counter());

        let outcome = runner.apply(&record("user-1", 0, "user-created")).unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);

        let login = record("user-1", 1, "user-logged-in");
        let ApplyOutcome::Applied(effects) = runner.apply(&login).unwrap() else {
            panic!("login should be applied");
        };
        assert_eq!(
            effects.into_iter().collect::<Vec<_>>(),
            vec![ProjectionEffect::LinkTo {
                stream_id: "logins".to_string(),
                record: login
            }]
        );

        assert_eq!(*runner.state(), 1);
        assert_eq!(runner.cursor("user-1"), Some(1));
        assert_eq!(runner.cursor("user-2"), None);
    }

    #[test]
    fn duplicates_are_ignored_per_source() {
        let mut runner = ProjectionRunner::new(login_counter());
        runner.apply(&record("user-1", 0, "user-logged-in")).unwrap();
        runner.apply(&record("user-2", 0, "user-logged-in")).unwrap();

        let again = runner.apply(&record("user-1", 0, "user-logged-in")).unwrap();
        assert_eq!(again, ApplyOutcome::Duplicate);
        assert_eq!(*runner.state(), 2);
    }

    #[test]
    fn rejects_records_from_other_streams() {
        let mut runner = ProjectionRunner::new(login_counter());
        let err = runner.apply(&record("order-1", 0, "user-logged-in")).unwrap_err();
        assert!(matches!(err, ProjectionError::UnknownSource { .. }));
    }

    #[test]
    fn restore_keeps_only_known_cursors() {
        let cursors = BTreeMap::from([("user-1".to_string(), 4), ("gone".to_string(), 9)]);
        let mut runner = ProjectionRunner::restore(login_counter(), 3, cursors);
        assert_eq!(runner.cursor("gone"), None);

        assert_eq!(
            runner.apply(&record("user-1", 4, "user-logged-in")).unwrap(),
            ApplyOutcome::Duplicate
        );
        runner.apply(&record("user-1", 5, "user-logged-in")).unwrap();
        assert_eq!(*runner.state(), 4);

        assert_eq!(runner.forget_cursor("user-1"), Some(5));
        assert!(matches!(
            runner.apply(&record("user-1", 0, "user-logged-in")).unwrap(),
            ApplyOutcome::Applied(_)
        ));
        assert_eq!(*runner.state(), 5);

        runner.reset();
        assert_eq!(*runner.state(), 0);
        assert!(runner.cursors().is_empty());
    }
}
