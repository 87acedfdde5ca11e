//! Out-of-band projection maintenance.
//!
//! Consistent Relational records are written by `EventStore::commit`. Everything
//! else that persists a record goes through this module:
//! - **Catch-up**: checkpointed passes over the global log
//! - **Backfill**: `EventStore::restore_projection` for designated entities
//! - **Listeners**: the projection worker applying post-commit notifications
//!
//! All paths skip versions a record already reflects, so redelivery is harmless.

pub mod apply;
pub mod catch_up;
pub mod checkpoint;

pub use apply::ProjectionApplier;
pub use catch_up::{CatchUpReport, ProjectionCatchUp};
pub use checkpoint::CheckpointTracker;
