use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use eventstorage_core::AggregateId;
use eventstorage_events::{Checkpoint, CheckpointType, EventEnvelope, ProjectionRecord, UncommittedEvent};

/// Storage driver operation error.
///
/// These are **backend** errors (IO, constraint violations, undecodable rows).
/// `EventStore` maps them to the caller-facing `EventStoreError` with entity context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// A uniqueness constraint rejected the write (concurrent append, duplicate checkpoint).
    #[error("conflict in {operation}: {message}")]
    Conflict { operation: String, message: String },

    /// An update targeted a row that does not exist.
    #[error("missing row in {operation}: {message}")]
    Missing { operation: String, message: String },

    /// A stored row could not be decoded.
    #[error("failed to decode row in {operation}: {message}")]
    Decode { operation: String, message: String },

    /// Connection, timeout or any other backend failure.
    #[error("storage backend failure in {operation}: {message}")]
    Backend { operation: String, message: String },
}

impl StorageError {
    pub fn conflict(operation: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn missing(operation: &str, message: impl Into<String>) -> Self {
        Self::Missing {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn decode(operation: &str, message: impl Into<String>) -> Self {
        Self::Decode {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn backend(operation: &str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict { .. })
    }
}

/// One transactional unit of work.
///
/// Everything written through a unit of work becomes visible on `commit` and is
/// discarded on `rollback` (or when the unit of work is dropped uncommitted).
#[async_trait]
pub trait UnitOfWork: Send {
    /// Version of the last stored event of the stream (`None` = no stream).
    async fn stream_version(&mut self, aggregate_id: &AggregateId) -> Result<Option<u64>, StorageError>;

    /// Append ordered events, assigning each a fresh global sequence.
    ///
    /// A duplicate `(aggregate_id, version)` fails with `StorageError::Conflict`.
    async fn append(&mut self, events: Vec<UncommittedEvent>) -> Result<Vec<EventEnvelope>, StorageError>;

    async fn load_record(
        &mut self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError>;

    /// Upsert a projection record unless the stored one is at a newer version.
    async fn save_record(&mut self, record: &ProjectionRecord) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Key-value access to projection records by (entity id, projection name).
///
/// Implemented by every storage driver and by alternate document stores; the
/// store picks one per projection from its `ProjectionStore`.
#[async_trait]
pub trait ProjectionSink: Send + Sync {
    async fn load_record(
        &self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError>;

    /// Upsert a projection record unless the stored one is at a newer version.
    ///
    /// Records therefore never move backward when a commit and a catch-up pass
    /// write the same entity concurrently.
    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError>;

    /// Delete every record of `projection`; returns how many were removed.
    async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError>;
}

/// Backend contract required by the event store.
#[async_trait]
pub trait StorageDriver: ProjectionSink {
    /// Atomically create event, projection and checkpoint storage if missing.
    ///
    /// Must be safe when several processes call it at once.
    async fn create_if_missing(&self) -> Result<(), StorageError>;

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;

    /// All envelopes of one entity, ordered by version.
    async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>, StorageError>;

    /// Envelopes with `after < sequence <= up_to`, ordered by sequence.
    async fn load_range(&self, after: u64, up_to: u64) -> Result<Vec<EventEnvelope>, StorageError>;

    /// Highest assigned global sequence, 0 when the store is empty.
    async fn max_sequence(&self) -> Result<u64, StorageError>;

    async fn load_checkpoint(
        &self,
        subscription: &str,
        kind: CheckpointType,
    ) -> Result<Option<Checkpoint>, StorageError>;

    /// `insert = true` writes a first-seen row (duplicate → `Conflict`);
    /// otherwise the existing row is updated (absent → `Missing`).
    ///
    /// Updates never lower the stored `seq`: a save from a pass that fell behind
    /// another one is skipped.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, insert: bool) -> Result<(), StorageError>;

    /// Overwrite an existing cursor unconditionally (absent → `Missing`).
    ///
    /// The only way a cursor moves backward.
    async fn reset_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;
}

#[async_trait]
impl<S> ProjectionSink for Arc<S>
where
    S: ProjectionSink + ?Sized,
{
    async fn load_record(
        &self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        (**self).load_record(aggregate_id, projection).await
    }

    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError> {
        (**self).save_record(record).await
    }

    async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError> {
        (**self).clear_projection(projection).await
    }
}

#[async_trait]
impl<S> StorageDriver for Arc<S>
where
    S: StorageDriver + ?Sized,
{
    async fn create_if_missing(&self) -> Result<(), StorageError> {
        (**self).create_if_missing().await
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        (**self).begin().await
    }

    async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>, StorageError> {
        (**self).load_stream(aggregate_id).await
    }

    async fn load_range(&self, after: u64, up_to: u64) -> Result<Vec<EventEnvelope>, StorageError> {
        (**self).load_range(after, up_to).await
    }

    async fn max_sequence(&self) -> Result<u64, StorageError> {
        (**self).max_sequence().await
    }

    async fn load_checkpoint(
        &self,
        subscription: &str,
        kind: CheckpointType,
    ) -> Result<Option<Checkpoint>, StorageError> {
        (**self).load_checkpoint(subscription, kind).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint, insert: bool) -> Result<(), StorageError> {
        (**self).save_checkpoint(checkpoint, insert).await
    }

    async fn reset_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        (**self).reset_checkpoint(checkpoint).await
    }
}
