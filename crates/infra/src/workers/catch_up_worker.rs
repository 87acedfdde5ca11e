use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::event_store::StorageDriver;
use crate::projections::ProjectionCatchUp;

use super::projection_worker::WorkerHandle;

/// Periodic catch-up of every persisted projection.
#[derive(Debug)]
pub struct CatchUpWorker;

impl CatchUpWorker {
    /// Run a pass over all persisted projections every `interval` until shut down.
    pub fn spawn<D>(catch_up: ProjectionCatchUp<D>, interval: Duration) -> WorkerHandle
    where
        D: StorageDriver + Clone + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        for result in catch_up.run_all().await {
                            match result {
                                Ok(report) if report.envelopes > 0 => {
                                    debug!(projection = %report.projection, to = report.to, "catch-up progressed");
                                }
                                Ok(_) => {}
                                Err(err) => warn!(error = %err, "catch-up pass failed"),
                            }
                        }
                    }
                }
            }
            debug!("catch-up worker stopped");
        });

        WorkerHandle::new(shutdown_tx, join)
    }
}
