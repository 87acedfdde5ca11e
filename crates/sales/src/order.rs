use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventstorage_core::{AggregateId, DomainError};
use eventstorage_events::{Aggregate, Entity, EntityError, Event, Handlers};

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Draft,
    Confirmed,
}

/// Order line: sku, quantity, unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    pub sku: String,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub customer: String,
}

impl Event for OrderPlaced {
    const EVENT_TYPE: &'static str = "sales.order.placed";
}

/// Event: ItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub line_no: u32,
    pub sku: String,
    pub quantity: i64,
    pub unit_price: u64,
}

impl Event for ItemAdded {
    const EVENT_TYPE: &'static str = "sales.order.item_added";
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {}

impl Event for OrderConfirmed {
    const EVENT_TYPE: &'static str = "sales.order.confirmed";
}

/// Entity state: Order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    placed: bool,
    customer: Option<String>,
    status: OrderStatus,
    lines: Vec<OrderLine>,
}

impl Order {
    pub fn is_placed(&self) -> bool {
        self.placed
    }

    pub fn customer(&self) -> Option<&str> {
        self.customer.as_deref()
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn is_modifiable(&self) -> bool {
        matches!(self.status, OrderStatus::Draft)
    }

    fn on_placed(&mut self, e: &OrderPlaced) {
        self.placed = true;
        self.customer = Some(e.customer.clone());
        self.status = OrderStatus::Draft;
        self.lines.clear();
    }

    fn on_item_added(&mut self, e: &ItemAdded) {
        self.lines.push(OrderLine {
            line_no: e.line_no,
            sku: e.sku.clone(),
            quantity: e.quantity,
            unit_price: e.unit_price,
        });
    }

    fn on_confirmed(&mut self, _e: &OrderConfirmed) {
        self.status = OrderStatus::Confirmed;
    }
}

impl Aggregate for Order {
    const AGGREGATE_TYPE: &'static str = "sales.order";

    fn create(_id: &AggregateId) -> Self {
        Self::default()
    }

    fn register(handlers: &mut Handlers<Self>) {
        handlers
            .on::<OrderPlaced>(Order::on_placed)
            .on::<ItemAdded>(Order::on_item_added)
            .on::<OrderConfirmed>(Order::on_confirmed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Entity(#[from] EntityError),
}

/// Business operations on an order entity. Each validates against current state
/// and raises the resulting event(s) as pending.
pub trait OrderCommands {
    fn place(&mut self, customer: &str) -> Result<(), OrderError>;
    fn add_item(&mut self, sku: &str, quantity: i64, unit_price: u64) -> Result<(), OrderError>;
    fn confirm(&mut self) -> Result<(), OrderError>;
}

impl OrderCommands for Entity<Order> {
    fn place(&mut self, customer: &str) -> Result<(), OrderError> {
        if self.state().is_placed() {
            return Err(DomainError::conflict("order already placed").into());
        }
        if customer.trim().is_empty() {
            return Err(DomainError::validation("customer must not be empty").into());
        }

        self.raise(OrderPlaced {
            customer: customer.to_string(),
        })?;
        Ok(())
    }

    fn add_item(&mut self, sku: &str, quantity: i64, unit_price: u64) -> Result<(), OrderError> {
        let order = self.state();
        if !order.is_placed() {
            return Err(DomainError::invariant("order has not been placed").into());
        }
        if !order.is_modifiable() {
            return Err(DomainError::invariant("cannot modify order once it is confirmed").into());
        }
        if sku.trim().is_empty() {
            return Err(DomainError::validation("sku must not be empty").into());
        }
        if quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive").into());
        }
        if unit_price == 0 {
            return Err(DomainError::validation("unit_price must be positive").into());
        }

        let line_no = order.lines().len() as u32 + 1;
        self.raise(ItemAdded {
            line_no,
            sku: sku.to_string(),
            quantity,
            unit_price,
        })?;
        Ok(())
    }

    fn confirm(&mut self) -> Result<(), OrderError> {
        let order = self.state();
        if !order.is_placed() {
            return Err(DomainError::invariant("order has not been placed").into());
        }
        if order.status() != OrderStatus::Draft {
            return Err(DomainError::invariant("only draft orders can be confirmed").into());
        }
        if order.lines().is_empty() {
            return Err(DomainError::validation("cannot confirm order without lines").into());
        }

        self.raise(OrderConfirmed {})?;
        Ok(())
    }
}
