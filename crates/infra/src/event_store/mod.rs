//! Event store boundary: the storage driver contract, its backends, and the
//! `EventStore` facade callers use.

pub mod error;
pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod r#trait;

pub use error::EventStoreError;
pub use in_memory::{InMemoryStorage, InMemoryUnitOfWork};
pub use postgres::{PostgresStorage, PostgresUnitOfWork};
pub use store::{EventStore, EventStoreBuilder};
pub use r#trait::{ProjectionSink, StorageDriver, StorageError, UnitOfWork};
