//! Commit notification publishing/subscription (mechanics only).
//!
//! The store releases an `EventSourceEnvelope` after every successful commit.
//! Delivery is best-effort and at-least-once: events are stored first, so a lost
//! notification is recovered by checkpoint catch-up, and consumers filter
//! duplicates by entity version.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("event bus publish failed: {0}")]
    Publish(String),
}

/// A subscription to a bus. Each subscription receives every published message.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Pub/sub abstraction for post-commit notifications.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
