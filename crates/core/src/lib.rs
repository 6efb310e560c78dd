//! `streamfold-core`: event model and aggregate building blocks.
//!
//! This crate contains **pure** primitives (no storage, no async runtime).

pub mod aggregate;
pub mod error;
pub mod event;

pub use aggregate::{
    Aggregate, AggregateRoot, AggregateState, EventHandlers, ExpectedVersion, OCCURRED_AT_KEY,
};
pub use error::{DomainError, DomainResult};
pub use event::{
    DomainEvent, EventDescriptor, EventRecord, EventStreamDescriptor, LINK_EVENT_TYPE,
    LinkTarget, StreamPosition, StreamReadDirection,
};
