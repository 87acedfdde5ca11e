//! `OrderSummary` read model.

use serde::{Deserialize, Serialize};

use eventstorage_events::{Event, Projection, ProjectionError, ProjectionMode, ProjectionStore, SourcedEvent};

use crate::order::{ItemAdded, OrderConfirmed, OrderPlaced, OrderStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub customer: Option<String>,
    pub status: OrderStatus,
    pub item_count: u32,
    pub total_quantity: i64,
    /// Sum of `quantity * unit_price`, in smallest currency unit.
    pub total_amount: u64,
}

/// Folds order events into an `OrderSummary`.
#[derive(Debug, Clone, Copy)]
pub struct OrderSummaryProjection {
    mode: ProjectionMode,
    store: ProjectionStore,
}

impl OrderSummaryProjection {
    pub const NAME: &'static str = "order_summary";

    pub fn new(mode: ProjectionMode, store: ProjectionStore) -> Self {
        Self { mode, store }
    }

    pub fn transient() -> Self {
        Self::new(ProjectionMode::Transient, ProjectionStore::Relational)
    }
}

impl Default for OrderSummaryProjection {
    fn default() -> Self {
        Self::new(ProjectionMode::Consistent, ProjectionStore::Relational)
    }
}

impl Projection for OrderSummaryProjection {
    type Model = OrderSummary;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn mode(&self) -> ProjectionMode {
        self.mode
    }

    fn store(&self) -> ProjectionStore {
        self.store
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            OrderPlaced::EVENT_TYPE | ItemAdded::EVENT_TYPE | OrderConfirmed::EVENT_TYPE
        )
    }

    fn apply(&self, model: &mut OrderSummary, event: &SourcedEvent) -> Result<(), ProjectionError> {
        if event.is::<OrderPlaced>() {
            let placed = event.decode::<OrderPlaced>()?;
            model.customer = Some(placed.customer);
            model.status = OrderStatus::Draft;
        } else if event.is::<ItemAdded>() {
            let item = event.decode::<ItemAdded>()?;
            let amount = u64::try_from(item.quantity)
                .ok()
                .and_then(|q| q.checked_mul(item.unit_price))
                .ok_or_else(|| ProjectionError::Apply {
                    projection: Self::NAME.to_string(),
                    event_type: event.event_type().to_string(),
                    message: "line amount out of range".to_string(),
                })?;
            model.item_count += 1;
            model.total_quantity += item.quantity;
            model.total_amount = model.total_amount.saturating_add(amount);
        } else if event.is::<OrderConfirmed>() {
            model.status = OrderStatus::Confirmed;
        }
        Ok(())
    }
}
