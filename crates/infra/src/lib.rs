//! Infrastructure layer: storage drivers, the event store facade, projection
//! maintenance, workers and configuration.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod workers;

pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use config::{ConfigError, EngineConfig};
pub use event_store::{
    EventStore, EventStoreBuilder, EventStoreError, InMemoryStorage, PostgresStorage, ProjectionSink, StorageDriver,
    StorageError, UnitOfWork,
};
pub use projections::{CatchUpReport, CheckpointTracker, ProjectionApplier, ProjectionCatchUp};
pub use read_model::InMemoryDocumentStore;
pub use workers::{CatchUpWorker, ProjectionWorker, WorkerHandle};

#[cfg(test)]
mod integration_tests;
