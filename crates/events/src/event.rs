use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventstorage_core::CorrelationId;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
///
/// Each event struct carries a stable type tag; the tag is persisted next to the
/// payload and is what handler and projection lookups key on.
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "order.placed").
    const EVENT_TYPE: &'static str;

    /// Schema version for this event type.
    const VERSION: u32 = 1;
}

/// Failure to move an event between its typed and serialized forms.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode '{event_type}': {message}")]
    Encode { event_type: String, message: String },

    #[error("failed to decode '{event_type}': {message}")]
    Decode { event_type: String, message: String },

    #[error("event type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },
}

/// An event as held by an entity: the serialized payload plus its type tag and
/// position in the entity's own stream.
///
/// This is what `eventStream` and `pendingEvents` contain. Global ordering
/// metadata is only assigned at persistence time (see `EventEnvelope`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedEvent {
    event_type: String,
    schema_version: u32,

    /// Position within the entity's stream (starts at 1, gapless).
    version: u64,

    occurred_at: DateTime<Utc>,
    correlation_id: Option<CorrelationId>,
    payload: JsonValue,
}

impl SourcedEvent {
    /// Serialize a typed event at the given stream version.
    pub fn encode<E: Event>(
        event: &E,
        version: u64,
        occurred_at: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
    ) -> Result<Self, CodecError> {
        let payload = serde_json::to_value(event).map_err(|e| CodecError::Encode {
            event_type: E::EVENT_TYPE.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            event_type: E::EVENT_TYPE.to_string(),
            schema_version: E::VERSION,
            version,
            occurred_at,
            correlation_id,
            payload,
        })
    }

    /// Rebuild from persisted parts (used by storage drivers).
    pub fn from_parts(
        event_type: impl Into<String>,
        schema_version: u32,
        version: u64,
        occurred_at: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            version,
            occurred_at,
            correlation_id,
            payload,
        }
    }

    /// Decode the payload into a typed event, checking the type tag first.
    pub fn decode<E: Event>(&self) -> Result<E, CodecError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(CodecError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                found: self.event_type.clone(),
            });
        }
        E::deserialize(&self.payload).map_err(|e| CodecError::Decode {
            event_type: self.event_type.clone(),
            message: e.to_string(),
        })
    }

    pub fn is<E: Event>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }
}
