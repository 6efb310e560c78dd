//! Append-only event store boundary.
//!
//! This module defines the storage-facing contract for per-stream event logs and
//! the in-memory reference implementation.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, EventStream, RecordFeed};
