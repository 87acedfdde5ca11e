//! `EventStore`: the caller-facing facade over a storage driver.
//!
//! ## Commit Flow
//!
//! ```text
//! Entity (pending events)
//!   ↓
//! 1. Begin unit of work
//!   ↓
//! 2. Compare expected version with the stored stream version (CAS)
//!   ↓
//! 3. Append pending events (fresh global sequence per envelope)
//!   ↓
//! 4. Update consistent Relational projections inside the same unit of work
//!   ↓
//! 5. Commit (or roll back everything on any failure)
//!   ↓
//! 6. Flush pending events, publish an EventSourceEnvelope (best effort)
//! ```
//!
//! One store manages one entity type. Document-store projections are not written
//! during commit; the projection worker and catch-up keep them current.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{Span, debug, info, instrument, warn};

use eventstorage_core::{AggregateId, AggregateRoot, TenantId};
use eventstorage_events::{
    Aggregate, Checkpoint, CheckpointType, DynProjection, Entity, EntityFactory, EventBus, EventEnvelope,
    EventSourceEnvelope, Incremental, Projection, ProjectionMode, ProjectionRecord, ProjectionRegistry,
    ProjectionStore, RestoreMode, SourcedEvent, UncommittedEvent, engine,
};

use super::error::EventStoreError;
use super::r#trait::{ProjectionSink, StorageDriver, StorageError, UnitOfWork};
use crate::projections::{CheckpointTracker, ProjectionApplier, ProjectionCatchUp};
use crate::read_model::InMemoryDocumentStore;

/// Builder for an `EventStore`; projections are validated on `build`.
pub struct EventStoreBuilder<A, D> {
    driver: D,
    projections: ProjectionRegistry,
    documents: Option<Arc<dyn ProjectionSink>>,
    bus: Option<Arc<dyn EventBus<EventSourceEnvelope>>>,
    tenant_id: TenantId,
    error: Option<String>,
    _entity: PhantomData<fn() -> A>,
}

impl<A: Aggregate, D: StorageDriver + Clone + 'static> EventStoreBuilder<A, D> {
    /// Register a projection. Duplicate names or models fail the build.
    pub fn projection<P: Projection>(mut self, projection: P) -> Self {
        if let Err(e) = self.projections.register(projection) {
            self.error.get_or_insert(e.to_string());
        }
        self
    }

    /// Destination of `Document`-store projections (in-memory by default).
    pub fn documents(mut self, documents: Arc<dyn ProjectionSink>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Listener bus receiving an `EventSourceEnvelope` after every commit.
    pub fn bus(mut self, bus: Arc<dyn EventBus<EventSourceEnvelope>>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn build(self) -> Result<EventStore<A, D>, EventStoreError> {
        if let Some(message) = self.error {
            return Err(EventStoreError::Registration(message));
        }
        let factory = EntityFactory::<A>::new().map_err(|e| EventStoreError::Registration(e.to_string()))?;
        let documents = self
            .documents
            .unwrap_or_else(|| Arc::new(InMemoryDocumentStore::new()));

        Ok(EventStore {
            applier: ProjectionApplier::new(self.driver.clone(), documents),
            driver: self.driver,
            factory,
            projections: Arc::new(self.projections),
            bus: self.bus,
            tenant_id: self.tenant_id,
            initialized: Mutex::new(false),
        })
    }
}

/// Event store for entities of type `A` over driver `D`.
pub struct EventStore<A: Aggregate, D> {
    driver: D,
    applier: ProjectionApplier<D>,
    factory: EntityFactory<A>,
    projections: Arc<ProjectionRegistry>,
    bus: Option<Arc<dyn EventBus<EventSourceEnvelope>>>,
    tenant_id: TenantId,
    initialized: Mutex<bool>,
}

impl<A: Aggregate, D> core::fmt::Debug for EventStore<A, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStore")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("projections", &self.projections)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate, D: StorageDriver + Clone + 'static> EventStore<A, D> {
    pub fn builder(driver: D) -> EventStoreBuilder<A, D> {
        EventStoreBuilder {
            driver,
            projections: ProjectionRegistry::new(),
            documents: None,
            bus: None,
            tenant_id: TenantId::unscoped(),
            error: None,
            _entity: PhantomData,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn projections(&self) -> &Arc<ProjectionRegistry> {
        &self.projections
    }

    pub fn applier(&self) -> &ProjectionApplier<D> {
        &self.applier
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn checkpoints(&self) -> CheckpointTracker<D> {
        CheckpointTracker::new(self.driver.clone())
    }

    /// Catch-up runner over this store's persisted projections.
    pub fn catch_up(&self, batch_size: u64) -> ProjectionCatchUp<D> {
        ProjectionCatchUp::new(self.applier.clone(), Arc::clone(&self.projections), batch_size)
    }

    /// Idempotent setup: storage resources and a checkpoint per persisted projection.
    ///
    /// Only one caller per store runs the setup; concurrent callers wait for it.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn init_source(&self) -> Result<(), EventStoreError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        self.driver
            .create_if_missing()
            .await
            .map_err(|e| EventStoreError::storage("init_source", A::AGGREGATE_TYPE, e))?;

        let tracker = self.checkpoints();
        for projection in self.projections.persisted() {
            tracker.load(projection.name(), CheckpointType::Projection).await?;
        }

        *initialized = true;
        info!(projections = self.projections.len(), "event source initialized");
        Ok(())
    }

    /// Restore the entity `identifier` from its full history, or create a fresh
    /// entity with a generated identifier when `identifier` is `None`.
    #[instrument(
        skip(self),
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = tracing::field::Empty, event_count = tracing::field::Empty),
        err
    )]
    pub async fn create_or_restore(&self, identifier: Option<&str>) -> Result<Entity<A>, EventStoreError> {
        let Some(identifier) = identifier else {
            let id = AggregateId::generate();
            Span::current().record("aggregate_id", id.as_str());
            let mut entity = self.factory.create(id.clone());
            entity
                .restore(Vec::new(), RestoreMode::Empty)
                .map_err(|e| EventStoreError::entity("create_or_restore", A::AGGREGATE_TYPE, &id, e))?;
            debug!("created new entity");
            return Ok(entity);
        };

        let id = AggregateId::parse(identifier).map_err(|e| EventStoreError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: e.to_string(),
        })?;
        Span::current().record("aggregate_id", id.as_str());

        let envelopes = self
            .driver
            .load_stream(&id)
            .await
            .map_err(|e| EventStoreError::storage("create_or_restore", describe::<A>(&id), e))?;

        let Some(first) = envelopes.first() else {
            return Err(EventStoreError::NotFound {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                aggregate_id: id,
            });
        };
        if let Some(foreign) = envelopes.iter().find(|e| e.aggregate_type() != first.aggregate_type()) {
            return Err(EventStoreError::NotConstructible {
                operation: "create_or_restore",
                requested: foreign.aggregate_type().to_string(),
                managed: first.aggregate_type().to_string(),
            });
        }

        let mut entity = self
            .factory
            .construct(first.aggregate_type(), id.clone())
            .map_err(|e| EventStoreError::entity("create_or_restore", A::AGGREGATE_TYPE, &id, e))?;

        let count = envelopes.len();
        let events = envelopes.into_iter().map(EventEnvelope::into_event).collect();
        entity
            .restore(events, RestoreMode::Stream)
            .map_err(|e| EventStoreError::entity("create_or_restore", A::AGGREGATE_TYPE, &id, e))?;

        Span::current().record("event_count", count);
        debug!(version = entity.version(), "entity restored");
        Ok(entity)
    }

    /// Persist the entity's pending events and its consistent projections atomically.
    ///
    /// Returns the committed envelopes; empty when nothing was pending. On any
    /// failure nothing is written and the events stay pending.
    #[instrument(
        skip(self, entity),
        fields(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %entity.id(),
            pending = entity.pending_events().len()
        ),
        err
    )]
    pub async fn commit(&self, entity: &mut Entity<A>) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if !entity.has_pending() {
            debug!("nothing to commit");
            return Ok(Vec::new());
        }

        let mut uow = self
            .driver
            .begin()
            .await
            .map_err(|e| EventStoreError::storage("commit", describe::<A>(entity.id()), e))?;

        let envelopes = match self.write(&mut uow, entity).await {
            Ok(envelopes) => envelopes,
            Err(err) => {
                if let Err(rollback) = uow.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        };

        uow.commit()
            .await
            .map_err(|e| self.append_error(entity, e))?;

        entity.flush_pending_events();
        info!(version = entity.version(), events = envelopes.len(), "commit succeeded");

        self.notify(entity.id(), &envelopes);
        Ok(envelopes)
    }

    async fn write(
        &self,
        uow: &mut Box<dyn UnitOfWork>,
        entity: &Entity<A>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let id = entity.id();
        let expected = entity.expected_version();

        let stored = uow
            .stream_version(id)
            .await
            .map_err(|e| EventStoreError::storage("commit", describe::<A>(id), e))?;
        if !expected.matches(stored) {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                aggregate_id: id.clone(),
                expected,
                detail: format!("stored version is {stored:?}"),
            });
        }

        let pending = entity.pending_events();
        let events = pending
            .iter()
            .cloned()
            .map(|event| UncommittedEvent {
                tenant_id: self.tenant_id,
                aggregate_id: id.clone(),
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                event,
            })
            .collect();

        let envelopes = uow
            .append(events)
            .await
            .map_err(|e| self.append_error(entity, e))?;

        for projection in self
            .projections
            .persisted()
            .filter(|p| p.store() == ProjectionStore::Relational)
        {
            if !engine::subscribes(pending, projection.as_ref()) {
                continue;
            }
            if let Some(record) = self.consistent_record(uow, projection.as_ref(), entity).await? {
                uow.save_record(&record)
                    .await
                    .map_err(|e| EventStoreError::storage("commit", describe::<A>(id), e))?;
            }
        }

        Ok(envelopes)
    }

    async fn consistent_record(
        &self,
        uow: &mut Box<dyn UnitOfWork>,
        projection: &dyn DynProjection,
        entity: &Entity<A>,
    ) -> Result<Option<ProjectionRecord>, EventStoreError> {
        let id = entity.id();
        let existing = uow
            .load_record(id, projection.name())
            .await
            .map_err(|e| EventStoreError::storage("commit", describe::<A>(id), e))?;

        let outcome = engine::project_incremental(projection, id, existing.as_ref(), entity.pending_events())
            .map_err(|e| EventStoreError::projection("commit", projection.name(), id.as_str(), e))?;

        match outcome {
            Incremental::Updated(record) => Ok(Some(record)),
            Incremental::Unchanged => Ok(None),
            Incremental::NeedsReplay { expected, found } => {
                debug!(projection = projection.name(), expected, found, "replaying entity history");
                let history: Vec<SourcedEvent> = entity
                    .event_stream()
                    .iter()
                    .chain(entity.pending_events())
                    .cloned()
                    .collect();
                engine::project_record(projection, id, &history)
                    .map_err(|e| EventStoreError::projection("commit", projection.name(), id.as_str(), e))
            }
        }
    }

    fn append_error(&self, entity: &Entity<A>, err: StorageError) -> EventStoreError {
        if err.is_conflict() {
            EventStoreError::ConcurrencyConflict {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                aggregate_id: entity.id().clone(),
                expected: entity.expected_version(),
                detail: err.to_string(),
            }
        } else {
            EventStoreError::storage("commit", describe::<A>(entity.id()), err)
        }
    }

    fn notify(&self, id: &AggregateId, envelopes: &[EventEnvelope]) {
        let Some(bus) = &self.bus else {
            return;
        };
        let message = EventSourceEnvelope::new(id.clone(), A::AGGREGATE_TYPE, envelopes.to_vec());
        if let Err(err) = bus.publish(message) {
            warn!(aggregate_id = %id, error = %err, "failed to publish commit notification");
        }
    }

    /// Current model of the projection registered for `M`.
    ///
    /// `None` when no projection is registered for `M` or the entity has no record.
    /// Transient projections are recomputed from the full stream on every call.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE, model = std::any::type_name::<M>()), err)]
    pub async fn project<M>(&self, identifier: &str) -> Result<Option<M>, EventStoreError>
    where
        M: DeserializeOwned + 'static,
    {
        let Some(projection) = self.projections.for_model::<M>() else {
            debug!("no projection registered for model");
            return Ok(None);
        };
        let Ok(id) = AggregateId::parse(identifier) else {
            return Ok(None);
        };

        let record = match projection.mode() {
            ProjectionMode::Transient => {
                let envelopes = self
                    .driver
                    .load_stream(&id)
                    .await
                    .map_err(|e| EventStoreError::storage("project", describe::<A>(&id), e))?;
                let events: Vec<SourcedEvent> = envelopes.into_iter().map(EventEnvelope::into_event).collect();
                engine::project_record(projection.as_ref(), &id, &events)
                    .map_err(|e| EventStoreError::projection("project", projection.name(), id.as_str(), e))?
            }
            ProjectionMode::Consistent => self
                .applier
                .sink_for(projection.store())
                .load_record(&id, projection.name())
                .await
                .map_err(|e| EventStoreError::storage("project", describe::<A>(&id), e))?,
        };

        record
            .map(|r| r.model::<M>())
            .transpose()
            .map_err(|e| EventStoreError::projection("project", projection.name(), id.as_str(), e))
    }

    /// Backfill: rebuild the records of projection `name` for the given entities
    /// from their full streams. Returns how many records were written.
    #[instrument(skip(self, sources), fields(sources = sources.len()), err)]
    pub async fn restore_projection(&self, name: &str, sources: &[AggregateId]) -> Result<usize, EventStoreError> {
        let projection = self
            .projections
            .by_name(name)
            .ok_or_else(|| EventStoreError::Registration(format!("no projection named '{name}'")))?;
        if projection.mode() == ProjectionMode::Transient {
            return Err(EventStoreError::Registration(format!(
                "projection '{name}' is transient and has no records"
            )));
        }

        let mut written = 0;
        for id in sources {
            if self.applier.rebuild(projection.as_ref(), id).await? {
                written += 1;
            }
        }
        info!(written, "projection restored");
        Ok(written)
    }

    /// Envelopes with `checkpoint.seq() < sequence <= checkpoint.max_seq()`, ascending.
    #[instrument(skip(self, checkpoint), fields(subscription = checkpoint.subscription(), seq = checkpoint.seq(), max_seq = checkpoint.max_seq()), err)]
    pub async fn load_events_past_checkpoint(&self, checkpoint: &Checkpoint) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.driver
            .load_range(checkpoint.seq(), checkpoint.max_seq())
            .await
            .map_err(|e| EventStoreError::storage("load_events_past_checkpoint", checkpoint.subscription(), e))
    }

    /// Highest global sequence, 0 for an empty store.
    pub async fn load_max_sequence(&self) -> Result<u64, EventStoreError> {
        self.driver
            .max_sequence()
            .await
            .map_err(|e| EventStoreError::storage("load_max_sequence", A::AGGREGATE_TYPE, e))
    }
}

fn describe<A: Aggregate>(id: &AggregateId) -> String {
    format!("{} '{id}'", A::AGGREGATE_TYPE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryStorage;
    use eventstorage_events::InMemoryEventBus;
    use eventstorage_sales::{Order, OrderCommands, OrderSummary, OrderSummaryProjection};

    fn store() -> EventStore<Order, InMemoryStorage> {
        EventStore::builder(InMemoryStorage::new())
            .projection(OrderSummaryProjection::default())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn restore_of_unknown_identifier_is_not_found() {
        let store = store();
        store.init_source().await.unwrap();

        let err = store.create_or_restore(Some("missing")).await.unwrap_err();
        assert!(matches!(err, EventStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn create_generates_identifier_and_starts_empty() {
        let store = store();
        let entity = store.create_or_restore(None).await.unwrap();
        assert_eq!(entity.version(), 0);
        assert!(!entity.id().as_str().is_empty());
    }

    #[tokio::test]
    async fn commit_without_pending_events_is_a_no_op() {
        let store = store();
        let mut order = store.create_or_restore(None).await.unwrap();
        assert!(store.commit(&mut order).await.unwrap().is_empty());
        assert_eq!(store.load_max_sequence().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_flushes_pending_and_updates_consistent_projection() {
        let store = store();
        store.init_source().await.unwrap();

        let mut order = store.create_or_restore(None).await.unwrap();
        order.place("acme").unwrap();
        order.add_item("sku-1", 2, 100).unwrap();
        let envelopes = store.commit(&mut order).await.unwrap();

        assert_eq!(envelopes.len(), 2);
        assert!(!order.has_pending());
        assert_eq!(order.version(), 2);

        let summary: OrderSummary = store.project(order.id().as_str()).await.unwrap().unwrap();
        assert_eq!(summary.total_amount, 200);
    }

    #[tokio::test]
    async fn duplicate_projection_fails_the_build() {
        let err = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .projection(OrderSummaryProjection::default())
            .projection(OrderSummaryProjection::transient())
            .build()
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Registration(_)));
    }

    #[tokio::test]
    async fn commit_publishes_to_listeners() {
        let bus = Arc::new(InMemoryEventBus::<EventSourceEnvelope>::new());
        let mut sub = bus.subscribe();
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .bus(bus.clone())
            .build()
            .unwrap();

        let mut order = store.create_or_restore(None).await.unwrap();
        order.place("acme").unwrap();
        store.commit(&mut order).await.unwrap();

        let published = sub.try_recv().unwrap();
        assert_eq!(published.source_id(), order.id());
        assert_eq!(published.events().len(), 1);
    }

    #[tokio::test]
    async fn project_without_registered_model_is_none() {
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new()).build().unwrap();
        let mut order = store.create_or_restore(None).await.unwrap();
        order.place("acme").unwrap();
        store.commit(&mut order).await.unwrap();

        let summary: Option<OrderSummary> = store.project(order.id().as_str()).await.unwrap();
        assert!(summary.is_none());
    }
}
