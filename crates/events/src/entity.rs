//! Entity (aggregate) runtime: replay history, buffer pending events.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use eventstorage_core::{AggregateId, AggregateRoot, CorrelationId, ExpectedVersion};

use crate::event::{CodecError, Event, SourcedEvent};
use crate::handler::Handlers;

/// An event-sourced entity type.
///
/// Implementors hold plain domain state; the runtime (`Entity<A>`) owns the
/// identity, version and event buffers. State only changes through the
/// handlers declared in `register`, so replaying the stream from `create`
/// reproduces the live state exactly.
pub trait Aggregate: Send + Sync + Sized + 'static {
    /// Type descriptor persisted with every envelope (e.g. "sales.order").
    const AGGREGATE_TYPE: &'static str;

    /// Empty state for a stream that has not applied any event yet.
    fn create(id: &AggregateId) -> Self;

    /// Declare one apply function per understood event type.
    fn register(handlers: &mut Handlers<Self>);
}

/// How `Entity::restore` treats the supplied history.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RestoreMode {
    /// Replay a full stream: sets `event_stream` and `version` from the events.
    Stream,
    /// Brand-new entity: no history to apply.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("{aggregate_type} has no handler for event type '{event_type}'")]
    UnhandledEventType {
        aggregate_type: String,
        event_type: String,
    },

    #[error("{aggregate_type} declares more than one handler for '{event_type}'")]
    DuplicateHandler {
        aggregate_type: String,
        event_type: String,
    },

    #[error("cannot construct '{requested}': this store manages '{managed}'")]
    NotConstructible { requested: String, managed: String },

    #[error("out-of-order event for '{aggregate_id}': expected version {expected}, found {found}")]
    OutOfOrder {
        aggregate_id: AggregateId,
        expected: u64,
        found: u64,
    },

    #[error("cannot restore '{aggregate_id}' while {count} event(s) are pending")]
    PendingEvents { aggregate_id: AggregateId, count: usize },

    #[error("empty restore received {count} event(s)")]
    UnexpectedHistory { count: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// In-memory entity: current state, committed history and pending events.
///
/// Entities are not shared for mutation across tasks; the store's concurrency
/// check on commit is the authoritative guard against lost updates.
pub struct Entity<A> {
    id: AggregateId,
    state: A,
    version: u64,
    event_stream: Vec<SourcedEvent>,
    pending_events: Vec<SourcedEvent>,
    correlation_id: Option<CorrelationId>,
    handlers: Arc<Handlers<A>>,
}

impl<A: core::fmt::Debug> core::fmt::Debug for Entity<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("committed", &self.event_stream.len())
            .field("pending", &self.pending_events.len())
            .finish()
    }
}

impl<A> Entity<A> {
    pub fn new(id: AggregateId, state: A, handlers: Arc<Handlers<A>>) -> Self {
        Self {
            id,
            state,
            version: 0,
            event_stream: Vec::new(),
            pending_events: Vec::new(),
            correlation_id: None,
            handlers,
        }
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn aggregate_type(&self) -> &'static str {
        self.handlers.aggregate_type()
    }

    /// Committed history, in version order.
    pub fn event_stream(&self) -> &[SourcedEvent] {
        &self.event_stream
    }

    /// Events produced since the last commit, in version order.
    pub fn pending_events(&self) -> &[SourcedEvent] {
        &self.pending_events
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_events.is_empty()
    }

    /// Version of the last committed event (`None` for a brand-new entity).
    pub fn committed_version(&self) -> Option<u64> {
        self.event_stream.last().map(SourcedEvent::version)
    }

    /// What a commit of this entity expects the stored stream to be at.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::from_last(self.committed_version())
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Stamp every subsequently raised event with `correlation_id`.
    pub fn correlate(&mut self, correlation_id: CorrelationId) {
        self.correlation_id = Some(correlation_id);
    }

    /// Record a new fact: apply it to state and buffer it as pending.
    ///
    /// If the event cannot be encoded or has no handler, the entity is left untouched.
    pub fn raise<E: Event>(&mut self, event: E) -> Result<(), EntityError> {
        let next = self.version + 1;
        let sourced = SourcedEvent::encode(&event, next, Utc::now(), self.correlation_id)?;

        self.handlers.apply(&mut self.state, &sourced)?;
        self.version = next;
        self.pending_events.push(sourced);
        Ok(())
    }

    /// Replay `events` onto this entity.
    ///
    /// Events must continue the entity's version sequence exactly. On error the
    /// entity may hold a partially applied state and must be discarded.
    pub fn restore(&mut self, events: Vec<SourcedEvent>, mode: RestoreMode) -> Result<(), EntityError> {
        match mode {
            RestoreMode::Empty => {
                if !events.is_empty() {
                    return Err(EntityError::UnexpectedHistory { count: events.len() });
                }
                Ok(())
            }
            RestoreMode::Stream => {
                if !self.pending_events.is_empty() {
                    return Err(EntityError::PendingEvents {
                        aggregate_id: self.id.clone(),
                        count: self.pending_events.len(),
                    });
                }

                for event in events {
                    let expected = self.version + 1;
                    if event.version() != expected {
                        return Err(EntityError::OutOfOrder {
                            aggregate_id: self.id.clone(),
                            expected,
                            found: event.version(),
                        });
                    }
                    self.handlers.apply(&mut self.state, &event)?;
                    self.version = expected;
                    self.event_stream.push(event);
                }
                Ok(())
            }
        }
    }

    /// Take the pending events and move them into the committed history.
    ///
    /// Called by the store only after the persistence unit of work has committed.
    pub fn flush_pending_events(&mut self) -> Vec<SourcedEvent> {
        let flushed = std::mem::take(&mut self.pending_events);
        self.event_stream.extend(flushed.iter().cloned());
        flushed
    }
}

impl<A> AggregateRoot for Entity<A> {
    fn id(&self) -> &AggregateId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
