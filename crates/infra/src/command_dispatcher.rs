//! Command execution with reload-and-retry on concurrency conflicts.
//!
//! ```text
//! Command
//!   ↓
//! 1. Restore the entity from its stream (or create it)
//!   ↓
//! 2. Run caller logic on the entity (raises pending events)
//!   ↓
//! 3. Commit (CAS on version, consistent projections, notification)
//!   ↓
//! 4. On ConcurrencyConflict: back to 1, up to `max_attempts`
//! ```
//!
//! Caller logic must be deterministic given the entity state: it is re-run
//! against freshly restored state on every attempt.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use eventstorage_events::{Aggregate, Entity, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StorageDriver};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Caller logic rejected the command; nothing was committed.
    #[error("command rejected: {0}")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Non-retryable store failure.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Every attempt hit a concurrency conflict.
    #[error("gave up after {attempts} conflicting attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: EventStoreError,
    },
}

/// Restore → decide → commit, retrying on conflicts.
#[derive(Debug)]
pub struct CommandDispatcher<A: Aggregate, D> {
    store: Arc<EventStore<A, D>>,
    max_attempts: u32,
}

impl<A: Aggregate, D> Clone for CommandDispatcher<A, D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            max_attempts: self.max_attempts,
        }
    }
}

impl<A: Aggregate, D: StorageDriver + Clone + 'static> CommandDispatcher<A, D> {
    pub fn new(store: Arc<EventStore<A, D>>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<EventStore<A, D>> {
        &self.store
    }

    /// Apply `decide` to the entity `identifier` (a new entity when `None`) and commit.
    ///
    /// Returns the committed envelopes; empty when `decide` raised nothing.
    #[instrument(skip(self, decide), fields(aggregate_type = A::AGGREGATE_TYPE, max_attempts = self.max_attempts), err)]
    pub async fn dispatch<F, E>(
        &self,
        identifier: Option<&str>,
        mut decide: F,
    ) -> Result<Vec<EventEnvelope>, DispatchError>
    where
        F: FnMut(&mut Entity<A>) -> Result<(), E> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut entity = self.store.create_or_restore(identifier).await?;
            decide(&mut entity).map_err(|e| DispatchError::Rejected(Box::new(e)))?;

            match self.store.commit(&mut entity).await {
                Ok(envelopes) => {
                    debug!(attempt, events = envelopes.len(), "command committed");
                    return Ok(envelopes);
                }
                Err(err) if err.is_retryable() => {
                    if attempt >= self.max_attempts {
                        return Err(DispatchError::RetriesExhausted { attempts: attempt, last: err });
                    }
                    warn!(attempt, error = %err, "concurrency conflict; reloading");
                }
                Err(err) => return Err(DispatchError::Store(err)),
            }
        }
    }
}
