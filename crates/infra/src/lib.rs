//! Infrastructure layer: storage backends, the event store, projections,
//! subscriptions, distributed locks and their operator surface.

pub mod admin;
pub mod config;
pub mod event_store;
pub mod locks;
pub mod projections;
pub mod storage;
pub mod subscriptions;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use admin::{AdminError, ProjectionManager, SubscriptionManager};
pub use config::{ConfigError, EngineConfig, ProjectionDaemonConfig, SubscriptionDaemonConfig};
pub use event_store::{EventStore, EventStoreError, EventStream, Session};
pub use locks::{DistributedLockProvider, InMemoryLockProvider, LockError, LockHandle, PostgresLockProvider};
pub use projections::{
    HandledEvents, Projection, ProjectionContext, ProjectionDaemon, ProjectionMode, ProjectionRegistry,
};
pub use storage::{InMemoryStorage, PostgresStorage, Storage, StorageError, StorageTx};
pub use subscriptions::{SubscriptionContext, SubscriptionDaemon, SubscriptionHandler, SubscriptionRegistry};
pub use workers::DaemonHandle;
