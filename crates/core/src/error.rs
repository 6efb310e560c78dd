//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures raised while folding or raising
/// events (missing handlers, payloads that do not decode, violated invariants).
/// Storage and transport concerns belong to the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An aggregate has no fold function registered for a stored event kind.
    ///
    /// This is an internal-consistency failure: it must never happen for events the
    /// aggregate produced itself.
    #[error("aggregate '{aggregate_type}' has no handler for event type '{event_type}'")]
    UnhandledEvent {
        aggregate_type: String,
        event_type: String,
    },

    /// An event payload did not match the shape its fold function expects.
    #[error("failed to decode event '{event_type}': {reason}")]
    EventDecode { event_type: String, reason: String },

    /// A typed event could not be turned into a JSON payload.
    #[error("failed to encode event '{event_type}': {reason}")]
    EventEncode { event_type: String, reason: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn unhandled(aggregate_type: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self::UnhandledEvent {
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
        }
    }

    pub fn decode(event_type: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::EventDecode {
            event_type: event_type.into(),
            reason: err.to_string(),
        }
    }

    pub fn encode(event_type: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::EventEncode {
            event_type: event_type.into(),
            reason: err.to_string(),
        }
    }
}
