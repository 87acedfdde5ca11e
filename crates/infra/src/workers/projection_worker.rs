use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use eventstorage_events::{EventBus, EventSourceEnvelope, ProjectionRegistry, ProjectionStore, Subscription, engine};

use crate::event_store::{EventStoreError, StorageDriver};
use crate::projections::ProjectionApplier;

/// Handle to stop and join a background worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown: watch::Sender<bool>, join: JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A message being handled is finished first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

/// Listener loop over a bus subscription.
///
/// - Handles messages in delivery order, one at a time
/// - Handler failures are logged and the loop continues
/// - Stops on shutdown or when the bus goes away
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a task feeding every message of `subscription` to `handler`.
    ///
    /// `handler` must tolerate redelivery.
    pub fn spawn<M, H, Fut, E>(name: &'static str, mut subscription: Subscription<M>, mut handler: H) -> WorkerHandle
    where
        M: Send + 'static,
        H: FnMut(M) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: core::fmt::Display + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    message = subscription.recv() => match message {
                        Some(message) => {
                            if let Err(err) = handler(message).await {
                                warn!(worker = name, error = %err, "projection worker handler failed");
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(worker = name, "worker stopped");
        });

        WorkerHandle::new(shutdown_tx, join)
    }

    /// Keep `Document`-store projections current from post-commit notifications.
    pub fn documents<D>(
        bus: &dyn EventBus<EventSourceEnvelope>,
        applier: ProjectionApplier<D>,
        projections: Arc<ProjectionRegistry>,
    ) -> WorkerHandle
    where
        D: StorageDriver + Clone + 'static,
    {
        Self::spawn("document-projections", bus.subscribe(), move |message: EventSourceEnvelope| {
            let applier = applier.clone();
            let projections = Arc::clone(&projections);
            async move { apply_documents(&applier, &projections, &message).await }
        })
    }
}

async fn apply_documents<D: StorageDriver>(
    applier: &ProjectionApplier<D>,
    projections: &ProjectionRegistry,
    message: &EventSourceEnvelope,
) -> Result<(), EventStoreError> {
    let events: Vec<_> = message.events().iter().map(|e| e.event().clone()).collect();

    for projection in projections
        .persisted()
        .filter(|p| p.store() == ProjectionStore::Document)
    {
        if !engine::subscribes(&events, projection.as_ref()) {
            continue;
        }
        applier
            .apply_batch(projection.as_ref(), message.source_id(), message.events())
            .await?;
        debug!(projection = projection.name(), aggregate_id = %message.source_id(), "document record updated");
    }
    Ok(())
}
