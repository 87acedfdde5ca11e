//! `eventstorage-core`: identity and versioning primitives.
//!
//! This crate contains **pure** building blocks shared by the event model, the
//! storage engine and domain modules (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::DomainError;
pub use id::{AggregateId, CorrelationId, TenantId};
