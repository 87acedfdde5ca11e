//! Catch-up: bring persisted projections up to date from the global log.
//!
//! One pass of a projection:
//!
//! ```text
//! load checkpoint ──► bound to min(store max, seq + batch_size)
//!        │
//!        ▼
//! load envelopes in (seq, max_seq] ──► apply per-entity runs ──► save checkpoint after each run
//!        │
//!        ▼
//! advance to max_seq and save
//! ```
//!
//! A failing run leaves the checkpoint at the end of the last applied run, so a
//! retry reprocesses only the unconfirmed tail.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use eventstorage_events::{CheckpointType, ProjectionMode, ProjectionRegistry};

use super::apply::{ProjectionApplier, entity_runs};
use super::checkpoint::CheckpointTracker;
use crate::event_store::{EventStoreError, StorageDriver};

/// Outcome of one catch-up pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    pub projection: String,
    /// Checkpoint before the pass.
    pub from: u64,
    /// Checkpoint after the pass.
    pub to: u64,
    pub envelopes: usize,
    pub records_written: usize,
    /// Whether the pass reached the store's max sequence.
    pub caught_up: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectionCatchUp<D> {
    applier: ProjectionApplier<D>,
    projections: Arc<ProjectionRegistry>,
    tracker: CheckpointTracker<D>,
    batch_size: u64,
}

impl<D: StorageDriver + Clone> ProjectionCatchUp<D> {
    pub fn new(applier: ProjectionApplier<D>, projections: Arc<ProjectionRegistry>, batch_size: u64) -> Self {
        let tracker = CheckpointTracker::new(applier.driver().clone());
        Self {
            applier,
            projections,
            tracker,
            batch_size: batch_size.max(1),
        }
    }

    pub fn tracker(&self) -> &CheckpointTracker<D> {
        &self.tracker
    }

    /// Run one bounded pass for projection `name`.
    #[instrument(skip(self), fields(batch_size = self.batch_size), err)]
    pub async fn run_once(&self, name: &str) -> Result<CatchUpReport, EventStoreError> {
        let projection = self
            .projections
            .by_name(name)
            .ok_or_else(|| EventStoreError::Registration(format!("no projection named '{name}'")))?;
        if projection.mode() == ProjectionMode::Transient {
            return Err(EventStoreError::Registration(format!(
                "projection '{name}' is transient and has no checkpoint"
            )));
        }

        let stored = self.tracker.load(name, CheckpointType::Projection).await?;
        let store_max = self
            .applier
            .driver()
            .max_sequence()
            .await
            .map_err(|e| EventStoreError::storage("catch_up", format!("projection '{name}'"), e))?;

        let mut checkpoint = stored.bounded(store_max, self.batch_size);
        let mut report = CatchUpReport {
            projection: name.to_string(),
            from: checkpoint.seq(),
            to: checkpoint.seq(),
            envelopes: 0,
            records_written: 0,
            caught_up: checkpoint.max_seq() >= store_max,
        };
        if checkpoint.is_caught_up() {
            return Ok(report);
        }

        let envelopes = self
            .applier
            .driver()
            .load_range(checkpoint.seq(), checkpoint.max_seq())
            .await
            .map_err(|e| EventStoreError::storage("catch_up", format!("projection '{name}'"), e))?;

        for run in entity_runs(&envelopes) {
            let Some(last) = run.last() else { continue };
            let aggregate_id = last.aggregate_id();

            match self.applier.apply_batch(projection.as_ref(), aggregate_id, run).await {
                Ok(written) => {
                    report.records_written += usize::from(written);
                    report.envelopes += run.len();
                }
                Err(err) => {
                    warn!(
                        projection = name,
                        aggregate_id = %aggregate_id,
                        checkpoint = checkpoint.seq(),
                        error = %err,
                        "catch-up stopped at last confirmed sequence"
                    );
                    return Err(err);
                }
            }

            checkpoint
                .advance(last.sequence())
                .map_err(|source| EventStoreError::Checkpoint { operation: "catch_up", source })?;
            self.tracker.save(&checkpoint, false).await?;
            debug!(projection = name, seq = checkpoint.seq(), "checkpoint advanced");
        }

        // Sequence gaps at the end of the range still count as processed.
        if checkpoint.seq() < checkpoint.max_seq() {
            let bound = checkpoint.max_seq();
            checkpoint
                .advance(bound)
                .map_err(|source| EventStoreError::Checkpoint { operation: "catch_up", source })?;
            self.tracker.save(&checkpoint, false).await?;
        }

        report.to = checkpoint.seq();
        info!(
            projection = name,
            from = report.from,
            to = report.to,
            envelopes = report.envelopes,
            records = report.records_written,
            "catch-up pass finished"
        );
        Ok(report)
    }

    /// Run one pass for every persisted projection.
    ///
    /// A failing projection does not stop the others; each gets its own result.
    pub async fn run_all(&self) -> Vec<Result<CatchUpReport, EventStoreError>> {
        let mut results = Vec::with_capacity(self.projections.len());
        for projection in self.projections.persisted() {
            results.push(self.run_once(projection.name()).await);
        }
        results
    }

    /// Repeat passes for `name` until it reaches the store's max sequence.
    pub async fn run_to_end(&self, name: &str) -> Result<Vec<CatchUpReport>, EventStoreError> {
        let mut reports = Vec::new();
        loop {
            let report = self.run_once(name).await?;
            let done = report.caught_up;
            reports.push(report);
            if done {
                return Ok(reports);
            }
        }
    }

    /// Administrative rebuild: drop the records of `name` and move its cursor
    /// back to the start of the log, so the next passes recompute every record.
    ///
    /// Returns the number of records dropped.
    #[instrument(skip(self), err)]
    pub async fn reset(&self, name: &str) -> Result<usize, EventStoreError> {
        let projection = self
            .projections
            .by_name(name)
            .ok_or_else(|| EventStoreError::Registration(format!("no projection named '{name}'")))?;
        if projection.mode() == ProjectionMode::Transient {
            return Err(EventStoreError::Registration(format!(
                "projection '{name}' is transient and has no checkpoint"
            )));
        }

        let cleared = self
            .applier
            .sink_for(projection.store())
            .clear_projection(name)
            .await
            .map_err(|e| EventStoreError::storage("reset", format!("projection '{name}'"), e))?;
        self.tracker.reset(name, CheckpointType::Projection).await?;

        info!(projection = name, cleared, "projection reset");
        Ok(cleared)
    }
}
