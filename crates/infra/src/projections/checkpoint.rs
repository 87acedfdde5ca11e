//! Checkpoint tracker: durable catch-up cursors, one per (subscription, kind).

use tracing::{debug, instrument};

use eventstorage_events::{Checkpoint, CheckpointType};

use crate::event_store::{EventStoreError, StorageDriver, StorageError};

#[derive(Debug, Clone)]
pub struct CheckpointTracker<D> {
    driver: D,
}

impl<D: StorageDriver> CheckpointTracker<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// Stored cursor of `subscription`, created at `seq = 0` when first seen.
    ///
    /// Two processes may both see no row; the loser of the insert race re-reads
    /// the winner's row.
    #[instrument(skip(self), err)]
    pub async fn load(&self, subscription: &str, kind: CheckpointType) -> Result<Checkpoint, EventStoreError> {
        if let Some(checkpoint) = self.read(subscription, kind).await? {
            return Ok(checkpoint);
        }

        let fresh = Checkpoint::new(subscription, kind);
        match self.driver.save_checkpoint(&fresh, true).await {
            Ok(()) => {
                debug!("first-seen checkpoint created");
                Ok(fresh)
            }
            Err(StorageError::Conflict { .. }) => self.read(subscription, kind).await?.ok_or_else(|| {
                EventStoreError::storage(
                    "load_checkpoint",
                    format!("checkpoint '{subscription}'"),
                    StorageError::missing("load_checkpoint", "row vanished after insert conflict"),
                )
            }),
            Err(e) => Err(EventStoreError::storage("load_checkpoint", format!("checkpoint '{subscription}'"), e)),
        }
    }

    /// Persist a cursor. `insert` marks a first write; an existing cursor is updated.
    #[instrument(skip(self, checkpoint), fields(subscription = checkpoint.subscription(), seq = checkpoint.seq()), err)]
    pub async fn save(&self, checkpoint: &Checkpoint, insert: bool) -> Result<(), EventStoreError> {
        self.driver
            .save_checkpoint(checkpoint, insert)
            .await
            .map_err(|e| EventStoreError::storage("save_checkpoint", format!("checkpoint '{}'", checkpoint.subscription()), e))
    }

    /// Administrative reset of `subscription` back to the start of the log.
    ///
    /// `save` never lowers a cursor; this is the only path that does.
    #[instrument(skip(self), err)]
    pub async fn reset(&self, subscription: &str, kind: CheckpointType) -> Result<Checkpoint, EventStoreError> {
        let mut checkpoint = self.load(subscription, kind).await?;
        checkpoint.reset();
        self.driver
            .reset_checkpoint(&checkpoint)
            .await
            .map_err(|e| EventStoreError::storage("reset_checkpoint", format!("checkpoint '{subscription}'"), e))?;
        Ok(checkpoint)
    }

    async fn read(&self, subscription: &str, kind: CheckpointType) -> Result<Option<Checkpoint>, EventStoreError> {
        self.driver
            .load_checkpoint(subscription, kind)
            .await
            .map_err(|e| EventStoreError::storage("load_checkpoint", format!("checkpoint '{subscription}'"), e))
    }
}
