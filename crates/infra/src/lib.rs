//! Infrastructure layer: the event store, subscriptions, the aggregate repository,
//! projections and configuration.

pub mod config;
pub mod event_store;
pub mod projections;
pub mod repository;
pub mod subscriptions;


pub use config::{ConfigError, EngineConfig};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore};
pub use projections::{ProjectionManager, ProjectionManagerError};
pub use repository::{EventSourcingRepository, RepositoryError, RepositoryOptions, SnapshotPolicy};
pub use subscriptions::{
    DeliveredEvent, DurableSubscriptionOptions, EventAckMode, Subscription, SubscriptionError,
    SubscriptionManager, SubscriptionOptions, SubscriptionState,
};
