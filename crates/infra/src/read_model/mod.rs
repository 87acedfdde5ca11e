//! Document stores: alternate sinks for `Document`-store projection records.
//!
//! The event store reaches them through the same `ProjectionSink` capability as
//! the storage driver, picked per projection by its `ProjectionStore`.

pub mod document_store;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use document_store::InMemoryDocumentStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisDocumentStore;
