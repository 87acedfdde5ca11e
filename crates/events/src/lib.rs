//! `eventstorage-events`: event model, entity runtime and projection mechanics.
//!
//! Nothing in this crate performs storage IO; drivers and the store facade live
//! in `eventstorage-infra`.

pub mod bus;
pub mod checkpoint;
pub mod engine;
pub mod entity;
pub mod envelope;
pub mod event;
pub mod factory;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;

pub use bus::{BusError, EventBus, Subscription};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointType};
pub use engine::Incremental;
pub use entity::{Aggregate, Entity, EntityError, RestoreMode};
pub use envelope::{EventEnvelope, EventSourceEnvelope, UncommittedEvent};
pub use event::{CodecError, Event, SourcedEvent};
pub use factory::EntityFactory;
pub use handler::Handlers;
pub use in_memory_bus::InMemoryEventBus;
pub use projection::{
    DynProjection, Projection, ProjectionError, ProjectionMode, ProjectionRecord, ProjectionRegistry,
    ProjectionStore,
};
