//! Background tasks: bus listeners and periodic catch-up.

pub mod catch_up_worker;
pub mod projection_worker;

pub use catch_up_worker::CatchUpWorker;
pub use projection_worker::{ProjectionWorker, WorkerHandle};
