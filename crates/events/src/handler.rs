//! Statically registered event handlers per entity type.
//!
//! Each entity type declares, once, which event types it understands and the
//! function that applies each of them (`Aggregate::register`). The registry is
//! built when the store is constructed, so a duplicate declaration is a startup
//! error and an unknown event type at replay is a hard `UnhandledEventType`.

use std::collections::HashMap;

use crate::entity::{Aggregate, EntityError};
use crate::event::{Event, SourcedEvent};

type ApplyFn<A> = Box<dyn Fn(&mut A, &SourcedEvent) -> Result<(), EntityError> + Send + Sync>;

/// Event-type → apply-function table for one entity type.
pub struct Handlers<A> {
    aggregate_type: &'static str,
    by_type: HashMap<&'static str, ApplyFn<A>>,
    duplicates: Vec<&'static str>,
}

impl<A> core::fmt::Debug for Handlers<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("Handlers")
            .field("aggregate_type", &self.aggregate_type)
            .field("event_types", &types)
            .finish()
    }
}

impl<A: Aggregate> Handlers<A> {
    /// Build and validate the handler table declared by `A`.
    pub fn build() -> Result<Self, EntityError> {
        let mut handlers = Self {
            aggregate_type: A::AGGREGATE_TYPE,
            by_type: HashMap::new(),
            duplicates: Vec::new(),
        };
        A::register(&mut handlers);

        if let Some(event_type) = handlers.duplicates.first() {
            return Err(EntityError::DuplicateHandler {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                event_type: event_type.to_string(),
            });
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            handlers = handlers.by_type.len(),
            "entity handlers registered"
        );
        Ok(handlers)
    }

    /// Declare the apply function for event type `E`.
    ///
    /// Declaring the same event type twice is reported by `build()`.
    pub fn on<E: Event>(&mut self, apply: fn(&mut A, &E)) -> &mut Self {
        if self.by_type.contains_key(E::EVENT_TYPE) {
            self.duplicates.push(E::EVENT_TYPE);
            return self;
        }

        self.by_type.insert(
            E::EVENT_TYPE,
            Box::new(move |state: &mut A, event: &SourcedEvent| {
                let typed = event.decode::<E>()?;
                apply(state, &typed);
                Ok(())
            }),
        );
        self
    }
}

impl<A> Handlers<A> {
    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    /// Apply one event to `state` through its registered handler.
    pub fn apply(&self, state: &mut A, event: &SourcedEvent) -> Result<(), EntityError> {
        let handler = self.by_type.get(event.event_type()).ok_or_else(|| {
            EntityError::UnhandledEventType {
                aggregate_type: self.aggregate_type.to_string(),
                event_type: event.event_type().to_string(),
            }
        })?;
        handler(state, event)
    }
}
