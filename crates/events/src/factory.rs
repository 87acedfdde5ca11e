use std::sync::Arc;

use eventstorage_core::AggregateId;

use crate::entity::{Aggregate, Entity, EntityError};
use crate::handler::Handlers;

/// Produces empty entities of one managed type, ready to receive replayed events.
///
/// The store is configured with the entity type it manages; a type descriptor
/// read from storage that names any other type is `NotConstructible`.
#[derive(Debug)]
pub struct EntityFactory<A> {
    handlers: Arc<Handlers<A>>,
}

impl<A> Clone for EntityFactory<A> {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<A: Aggregate> EntityFactory<A> {
    /// Build the handler table for `A` (fails on duplicate registrations).
    pub fn new() -> Result<Self, EntityError> {
        Ok(Self {
            handlers: Arc::new(Handlers::build()?),
        })
    }

    pub fn aggregate_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    pub fn handlers(&self) -> &Arc<Handlers<A>> {
        &self.handlers
    }

    /// Construct an event-less entity for `type_descriptor`.
    pub fn construct(&self, type_descriptor: &str, id: AggregateId) -> Result<Entity<A>, EntityError> {
        if type_descriptor != A::AGGREGATE_TYPE {
            return Err(EntityError::NotConstructible {
                requested: type_descriptor.to_string(),
                managed: A::AGGREGATE_TYPE.to_string(),
            });
        }
        Ok(self.create(id))
    }

    /// Construct an event-less entity of the managed type.
    pub fn create(&self, id: AggregateId) -> Entity<A> {
        let state = A::create(&id);
        Entity::new(id, state, Arc::clone(&self.handlers))
    }
}
