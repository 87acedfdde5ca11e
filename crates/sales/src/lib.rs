//! Sales orders reference domain (event-sourced).
//!
//! Business rules live on `Entity<Order>` via `OrderCommands`; they are pure
//! and deterministic (no IO, no storage).

pub mod order;
pub mod summary;

pub use order::{
    ItemAdded, Order, OrderCommands, OrderConfirmed, OrderError, OrderLine, OrderPlaced, OrderStatus,
};
pub use summary::{OrderSummary, OrderSummaryProjection};
