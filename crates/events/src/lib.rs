//! Live feeds, cancellation and projection folding.
//!
//! Everything here is storage-agnostic; the infrastructure crate wires these
//! pieces to an event store.

pub mod bus;
pub mod cancellation;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::{LiveFeed, Unsubscribe};
pub use cancellation::{CancellationSignal, Cancelled};
pub use in_memory_bus::{FanOut, FanOutError};
pub use projection::{ProjectionBuilder, ProjectionDefinition, ProjectionEffect, ProjectionEffects};
pub use runner::{ApplyOutcome, ProjectionError, ProjectionRunner};
