use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventstorage_core::{AggregateId, CorrelationId, TenantId};

use crate::event::SourcedEvent;

/// A persisted event plus its ordering and identity metadata.
///
/// This is the unit the store hands back from loads and range scans.
///
/// Notes:
/// - **Immutable** once persisted: there are no setters.
/// - `sequence` is global, strictly increasing and gap-tolerant across the whole store.
/// - `(aggregate_id, version)` is unique; `version` starts at 1 and has no gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    sequence: u64,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    event: SourcedEvent,
}

impl EventEnvelope {
    pub fn new(
        sequence: u64,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event: SourcedEvent,
    ) -> Self {
        Self {
            sequence,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Global (UUID) identifier of the owning stream.
    pub fn global_id(&self) -> Uuid {
        self.aggregate_id.global_id()
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> u64 {
        self.event.version()
    }

    pub fn event_type(&self) -> &str {
        self.event.event_type()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.event.occurred_at()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.event.correlation_id()
    }

    pub fn payload(&self) -> &JsonValue {
        self.event.payload()
    }

    pub fn event(&self) -> &SourcedEvent {
        &self.event
    }

    pub fn into_event(self) -> SourcedEvent {
        self.event
    }
}

/// An event ready to be appended to a stream (not yet assigned a sequence number).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event: SourcedEvent,
}

impl UncommittedEvent {
    /// Assign the global sequence, producing the persisted envelope.
    pub fn into_envelope(self, sequence: u64) -> EventEnvelope {
        EventEnvelope::new(
            sequence,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type,
            self.event,
        )
    }
}

/// Commit-scoped notification: which entity changed and the envelopes just persisted.
///
/// Released to listeners after a successful commit (best-effort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSourceEnvelope {
    source_id: AggregateId,
    global_id: Uuid,
    aggregate_type: String,
    events: Vec<EventEnvelope>,
}

impl EventSourceEnvelope {
    pub fn new(
        source_id: AggregateId,
        aggregate_type: impl Into<String>,
        events: Vec<EventEnvelope>,
    ) -> Self {
        Self {
            global_id: source_id.global_id(),
            source_id,
            aggregate_type: aggregate_type.into(),
            events,
        }
    }

    pub fn source_id(&self) -> &AggregateId {
        &self.source_id
    }

    pub fn global_id(&self) -> Uuid {
        self.global_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    /// Highest global sequence contained in this commit.
    pub fn last_sequence(&self) -> Option<u64> {
        self.events.iter().map(EventEnvelope::sequence).max()
    }
}
