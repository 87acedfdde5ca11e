use thiserror::Error;

use eventstorage_core::{AggregateId, ExpectedVersion};
use eventstorage_events::{CheckpointError, EntityError, ProjectionError};

use super::r#trait::StorageError;

/// Event store operation error.
///
/// Every variant names the operation and the entity (or projection) involved.
///
/// ## Error Categories
///
/// - **NotFound**: restore of an identifier with no persisted history
/// - **ConcurrencyConflict**: the stream moved since the entity was loaded (retryable)
/// - **UnhandledEventType** / **NotConstructible**: code/schema skew, never retried
/// - **StorageFailure** / **SerializationFailure**: backend or payload problems
/// - **Projection** / **Checkpoint**: derived-state failures
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("{aggregate_type} '{aggregate_id}' not found")]
    NotFound {
        aggregate_type: String,
        aggregate_id: AggregateId,
    },

    #[error("invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("concurrency conflict on {aggregate_type} '{aggregate_id}' (expected {expected:?}): {detail}")]
    ConcurrencyConflict {
        aggregate_type: String,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        detail: String,
    },

    #[error("{aggregate_type} '{aggregate_id}' has no handler for event type '{event_type}' ({operation})")]
    UnhandledEventType {
        operation: &'static str,
        aggregate_type: String,
        aggregate_id: AggregateId,
        event_type: String,
    },

    #[error("cannot construct '{requested}' ({operation}): this store manages '{managed}'")]
    NotConstructible {
        operation: &'static str,
        requested: String,
        managed: String,
    },

    #[error("storage failure during {operation} ({context}): {source}")]
    StorageFailure {
        operation: &'static str,
        context: String,
        #[source]
        source: StorageError,
    },

    #[error("serialization failure during {operation} ({context}): {message}")]
    SerializationFailure {
        operation: &'static str,
        context: String,
        message: String,
    },

    #[error("invalid history during {operation} of '{aggregate_id}': {source}")]
    InvalidHistory {
        operation: &'static str,
        aggregate_id: AggregateId,
        #[source]
        source: EntityError,
    },

    #[error("projection '{projection}' failed during {operation} ({context}): {source}")]
    Projection {
        operation: &'static str,
        projection: String,
        context: String,
        #[source]
        source: ProjectionError,
    },

    #[error("checkpoint failure during {operation}: {source}")]
    Checkpoint {
        operation: &'static str,
        #[source]
        source: CheckpointError,
    },

    #[error("registration error: {0}")]
    Registration(String),
}

impl EventStoreError {
    /// Only concurrency conflicts are worth a reload-and-retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }

    pub(crate) fn storage(operation: &'static str, context: impl Into<String>, source: StorageError) -> Self {
        match source {
            StorageError::Decode { message, .. } => EventStoreError::SerializationFailure {
                operation,
                context: context.into(),
                message,
            },
            source => EventStoreError::StorageFailure {
                operation,
                context: context.into(),
                source,
            },
        }
    }

    pub(crate) fn entity(
        operation: &'static str,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
        source: EntityError,
    ) -> Self {
        match source {
            EntityError::UnhandledEventType { event_type, .. } => EventStoreError::UnhandledEventType {
                operation,
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.clone(),
                event_type,
            },
            EntityError::NotConstructible { requested, managed } => EventStoreError::NotConstructible {
                operation,
                requested,
                managed,
            },
            EntityError::Codec(codec) => EventStoreError::SerializationFailure {
                operation,
                context: format!("{aggregate_type} '{aggregate_id}'"),
                message: codec.to_string(),
            },
            source => EventStoreError::InvalidHistory {
                operation,
                aggregate_id: aggregate_id.clone(),
                source,
            },
        }
    }

    pub(crate) fn projection(
        operation: &'static str,
        projection: &str,
        context: impl Into<String>,
        source: ProjectionError,
    ) -> Self {
        match source {
            ProjectionError::Decode(codec) => EventStoreError::SerializationFailure {
                operation,
                context: format!("projection '{projection}': {}", context.into()),
                message: codec.to_string(),
            },
            source => EventStoreError::Projection {
                operation,
                projection: projection.to_string(),
                context: context.into(),
                source,
            },
        }
    }
}
