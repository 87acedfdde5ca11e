//! Integration tests for the full pipeline.
//!
//! Tests: Entity → EventStore → StorageDriver → Projections → Checkpoints
//!
//! Verifies:
//! - Versions stay gapless across commits of any size
//! - Stale entities are rejected and leave the store untouched
//! - Event append and consistent projection writes commit together
//! - Catch-up honours checkpoint bounds and stops at the last confirmed run

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;

    use eventstorage_core::{AggregateId, AggregateRoot};
    use eventstorage_events::{
        Aggregate, BusError, Event, Checkpoint, CheckpointType, Entity, EventBus, EventEnvelope, EventSourceEnvelope,
        InMemoryEventBus, ProjectionMode, ProjectionRecord, ProjectionStore, Subscription, UncommittedEvent,
    };
    use eventstorage_sales::{
        ItemAdded, Order, OrderCommands, OrderPlaced, OrderStatus, OrderSummary, OrderSummaryProjection,
    };

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::event_store::{
        EventStore, EventStoreError, InMemoryStorage, ProjectionSink, StorageDriver, StorageError, UnitOfWork,
    };
    use crate::read_model::InMemoryDocumentStore;
    use crate::workers::ProjectionWorker;

    /// Failures to inject into `FaultyStorage`.
    #[derive(Debug, Default)]
    struct Faults {
        /// Projection writes inside a unit of work fail.
        fail_uow_record_saves: AtomicBool,
        /// The next N appends report a concurrent writer.
        append_conflicts: AtomicU32,
        /// Out-of-band record saves for these entities fail.
        fail_sink_saves_for: Mutex<HashSet<AggregateId>>,
    }

    #[derive(Debug, Clone, Default)]
    struct FaultyStorage {
        inner: InMemoryStorage,
        faults: Arc<Faults>,
    }

    struct FaultyUnitOfWork {
        inner: Box<dyn UnitOfWork>,
        faults: Arc<Faults>,
    }

    #[async_trait]
    impl UnitOfWork for FaultyUnitOfWork {
        async fn stream_version(&mut self, aggregate_id: &AggregateId) -> Result<Option<u64>, StorageError> {
            self.inner.stream_version(aggregate_id).await
        }

        async fn append(&mut self, events: Vec<UncommittedEvent>) -> Result<Vec<EventEnvelope>, StorageError> {
            let pending = self.faults.append_conflicts.load(Ordering::SeqCst);
            if pending > 0 {
                self.faults.append_conflicts.store(pending - 1, Ordering::SeqCst);
                return Err(StorageError::conflict("append", "injected concurrent writer"));
            }
            self.inner.append(events).await
        }

        async fn load_record(
            &mut self,
            aggregate_id: &AggregateId,
            projection: &str,
        ) -> Result<Option<ProjectionRecord>, StorageError> {
            self.inner.load_record(aggregate_id, projection).await
        }

        async fn save_record(&mut self, record: &ProjectionRecord) -> Result<(), StorageError> {
            if self.faults.fail_uow_record_saves.load(Ordering::SeqCst) {
                return Err(StorageError::backend("save_record", "injected projection write failure"));
            }
            self.inner.save_record(record).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.rollback().await
        }
    }

    #[async_trait]
    impl ProjectionSink for FaultyStorage {
        async fn load_record(
            &self,
            aggregate_id: &AggregateId,
            projection: &str,
        ) -> Result<Option<ProjectionRecord>, StorageError> {
            ProjectionSink::load_record(&self.inner, aggregate_id, projection).await
        }

        async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError> {
            let blocked = self
                .faults
                .fail_sink_saves_for
                .lock()
                .map(|set| set.contains(&record.aggregate_id))
                .unwrap_or(false);
            if blocked {
                return Err(StorageError::backend("save_record", "injected sink failure"));
            }
            ProjectionSink::save_record(&self.inner, record).await
        }

        async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError> {
            self.inner.clear_projection(projection).await
        }
    }

    #[async_trait]
    impl StorageDriver for FaultyStorage {
        async fn create_if_missing(&self) -> Result<(), StorageError> {
            self.inner.create_if_missing().await
        }

        async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
            Ok(Box::new(FaultyUnitOfWork {
                inner: self.inner.begin().await?,
                faults: Arc::clone(&self.faults),
            }))
        }

        async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>, StorageError> {
            self.inner.load_stream(aggregate_id).await
        }

        async fn load_range(&self, after: u64, up_to: u64) -> Result<Vec<EventEnvelope>, StorageError> {
            self.inner.load_range(after, up_to).await
        }

        async fn max_sequence(&self) -> Result<u64, StorageError> {
            self.inner.max_sequence().await
        }

        async fn load_checkpoint(
            &self,
            subscription: &str,
            kind: CheckpointType,
        ) -> Result<Option<Checkpoint>, StorageError> {
            self.inner.load_checkpoint(subscription, kind).await
        }

        async fn save_checkpoint(&self, checkpoint: &Checkpoint, insert: bool) -> Result<(), StorageError> {
            self.inner.save_checkpoint(checkpoint, insert).await
        }

        async fn reset_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
            self.inner.reset_checkpoint(checkpoint).await
        }
    }

    /// A bus that refuses every message.
    struct ClosedBus;

    impl EventBus<EventSourceEnvelope> for ClosedBus {
        fn publish(&self, _message: EventSourceEnvelope) -> Result<(), BusError> {
            Err(BusError::Closed)
        }

        fn subscribe(&self) -> Subscription<EventSourceEnvelope> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Subscription::new(rx)
        }
    }

    fn consistent_store<D: StorageDriver + Clone + 'static>(driver: D) -> EventStore<Order, D> {
        EventStore::builder(driver)
            .projection(OrderSummaryProjection::default())
            .build()
            .unwrap()
    }

    fn summary_projection(store: ProjectionStore) -> OrderSummaryProjection {
        OrderSummaryProjection::new(ProjectionMode::Consistent, store)
    }

    /// Place an order with `items` lines and commit it; returns its id.
    async fn placed_order<D: StorageDriver + Clone + 'static>(store: &EventStore<Order, D>, items: u32) -> String {
        let mut order = store.create_or_restore(None).await.unwrap();
        order.place("acme").unwrap();
        for i in 0..items {
            order.add_item(&format!("sku-{i}"), 1, 100).unwrap();
        }
        store.commit(&mut order).await.unwrap();
        order.id().as_str().to_string()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn version_equals_committed_event_count(batches in prop::collection::vec(1usize..5, 1..6)) {
            let (version, expected, versions) = runtime().block_on(async {
                let store = consistent_store(InMemoryStorage::new());
                let id = placed_order(&store, 0).await;
                let mut total = 1u64;

                for (batch_no, size) in batches.iter().enumerate() {
                    let mut order = store.create_or_restore(Some(&id)).await.unwrap();
                    for i in 0..*size {
                        order.add_item(&format!("sku-{batch_no}-{i}"), 1, 10).unwrap();
                    }
                    store.commit(&mut order).await.unwrap();
                    total += *size as u64;
                }

                let restored = store.create_or_restore(Some(&id)).await.unwrap();
                let versions: Vec<u64> = restored.event_stream().iter().map(|e| e.version()).collect();
                (restored.version(), total, versions)
            });

            prop_assert_eq!(version, expected);
            prop_assert_eq!(versions, (1..=expected).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn order_scenario_reaches_expected_summary() {
        let store = consistent_store(InMemoryStorage::new());
        store.init_source().await.unwrap();

        let mut order = store.create_or_restore(None).await.unwrap();
        order.place("acme").unwrap();
        order.add_item("sku-1", 2, 150).unwrap();
        store.commit(&mut order).await.unwrap();

        let id = order.id().as_str().to_string();
        let mut order = store.create_or_restore(Some(&id)).await.unwrap();
        order.add_item("sku-2", 1, 40).unwrap();
        order.confirm().unwrap();
        store.commit(&mut order).await.unwrap();

        assert_eq!(order.version(), 4);
        let summary: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(summary.status, OrderStatus::Confirmed);
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.total_amount, 340);
    }

    #[tokio::test]
    async fn stale_commit_is_rejected_and_leaves_store_untouched() {
        let store = consistent_store(InMemoryStorage::new());
        let id = placed_order(&store, 0).await;

        let mut first = store.create_or_restore(Some(&id)).await.unwrap();
        let mut second = store.create_or_restore(Some(&id)).await.unwrap();

        first.add_item("sku-1", 1, 100).unwrap();
        store.commit(&mut first).await.unwrap();

        second.add_item("sku-2", 5, 999).unwrap();
        let err = store.commit(&mut second).await.unwrap_err();

        assert!(matches!(err, EventStoreError::ConcurrencyConflict { .. }));
        assert!(err.is_retryable());
        assert!(second.has_pending());
        assert_eq!(store.load_max_sequence().await.unwrap(), 2);

        let restored = store.create_or_restore(Some(&id)).await.unwrap();
        assert_eq!(restored.version(), 2);
        assert_eq!(restored.state().lines()[0].sku, "sku-1");

        let summary: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(summary.total_amount, 100);
    }

    #[tokio::test]
    async fn new_entity_with_taken_identifier_conflicts() {
        let storage = InMemoryStorage::new();
        let store = consistent_store(storage);
        let id = placed_order(&store, 0).await;

        // A fresh entity claims the same identifier as an existing stream.
        let factory = eventstorage_events::EntityFactory::<Order>::new().unwrap();
        let mut duplicate: Entity<Order> = factory.create(AggregateId::parse(id.as_str()).unwrap());
        duplicate.place("other").unwrap();

        let err = store.commit(&mut duplicate).await.unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn restoring_twice_yields_identical_state() {
        let store = consistent_store(InMemoryStorage::new());
        let id = placed_order(&store, 3).await;

        let a = store.create_or_restore(Some(&id)).await.unwrap();
        let b = store.create_or_restore(Some(&id)).await.unwrap();

        assert_eq!(a.state(), b.state());
        assert_eq!(a.event_stream(), b.event_stream());
        assert_eq!(a.version(), b.version());
    }

    #[tokio::test]
    async fn failed_projection_write_discards_the_append() {
        let storage = FaultyStorage::default();
        let store = consistent_store(storage.clone());
        let id = placed_order(&store, 1).await;

        storage.faults.fail_uow_record_saves.store(true, Ordering::SeqCst);
        let mut order = store.create_or_restore(Some(&id)).await.unwrap();
        order.add_item("sku-9", 1, 1).unwrap();
        let err = store.commit(&mut order).await.unwrap_err();

        assert!(matches!(err, EventStoreError::StorageFailure { .. }));
        assert!(order.has_pending());
        assert_eq!(store.load_max_sequence().await.unwrap(), 2);
        let summary: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(summary.item_count, 1);

        // Pending events survive the failure; a retry commits them.
        storage.faults.fail_uow_record_saves.store(false, Ordering::SeqCst);
        store.commit(&mut order).await.unwrap();
        assert_eq!(order.version(), 3);
        let summary: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(summary.item_count, 2);
    }

    #[tokio::test]
    async fn events_past_checkpoint_respect_both_bounds() {
        let store = consistent_store(InMemoryStorage::new());
        for _ in 0..3 {
            placed_order(&store, 1).await;
        }
        assert_eq!(store.load_max_sequence().await.unwrap(), 6);

        let checkpoint = Checkpoint::from_parts("order_summary", 2, 5, CheckpointType::Projection);
        let first: Vec<u64> = store
            .load_events_past_checkpoint(&checkpoint)
            .await
            .unwrap()
            .iter()
            .map(EventEnvelope::sequence)
            .collect();
        let second: Vec<u64> = store
            .load_events_past_checkpoint(&checkpoint)
            .await
            .unwrap()
            .iter()
            .map(EventEnvelope::sequence)
            .collect();

        assert_eq!(first, vec![3, 4, 5]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn transient_projection_matches_consistent_record() {
        let storage = InMemoryStorage::new();
        let consistent = consistent_store(storage.clone());
        let transient = EventStore::<Order, _>::builder(storage)
            .projection(OrderSummaryProjection::transient())
            .build()
            .unwrap();

        let id = placed_order(&consistent, 3).await;
        let mut order = consistent.create_or_restore(Some(&id)).await.unwrap();
        order.confirm().unwrap();
        consistent.commit(&mut order).await.unwrap();

        let persisted: OrderSummary = consistent.project(&id).await.unwrap().unwrap();
        let replayed: OrderSummary = transient.project(&id).await.unwrap().unwrap();
        assert_eq!(persisted, replayed);
    }

    #[tokio::test]
    async fn projection_registered_late_is_rebuilt_on_next_commit() {
        let storage = InMemoryStorage::new();
        let bare = EventStore::<Order, _>::builder(storage.clone()).build().unwrap();
        let id = placed_order(&bare, 2).await;

        let store = consistent_store(storage);
        let summary: Option<OrderSummary> = store.project(&id).await.unwrap();
        assert!(summary.is_none());

        let mut order = store.create_or_restore(Some(&id)).await.unwrap();
        order.add_item("sku-late", 3, 10).unwrap();
        store.commit(&mut order).await.unwrap();

        let summary: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(summary.item_count, 3);
        assert_eq!(summary.total_amount, 230);
    }

    #[tokio::test]
    async fn catch_up_fills_document_store_and_advances_checkpoint() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .projection(summary_projection(ProjectionStore::Document))
            .documents(documents.clone())
            .build()
            .unwrap();
        store.init_source().await.unwrap();

        let ids = [placed_order(&store, 1).await, placed_order(&store, 2).await];
        let before: Option<OrderSummary> = store.project(&ids[0]).await.unwrap();
        assert!(before.is_none());

        let reports = store.catch_up(2).run_to_end(OrderSummaryProjection::NAME).await.unwrap();
        assert!(reports.len() >= 3);
        assert_eq!(reports.last().map(|r| r.to), Some(5));

        let second: OrderSummary = store.project(&ids[1]).await.unwrap().unwrap();
        assert_eq!(second.item_count, 2);
        assert_eq!(documents.list(OrderSummaryProjection::NAME).len(), 2);

        let checkpoint = store
            .checkpoints()
            .load(OrderSummaryProjection::NAME, CheckpointType::Projection)
            .await
            .unwrap();
        assert_eq!(checkpoint.seq(), 5);

        // Nothing new: the next pass is a no-op.
        let idle = store.catch_up(2).run_once(OrderSummaryProjection::NAME).await.unwrap();
        assert_eq!(idle.envelopes, 0);
        assert!(idle.caught_up);
    }

    #[tokio::test]
    async fn catch_up_failure_keeps_checkpoint_at_last_confirmed_run() {
        let storage = FaultyStorage::default();
        let store = EventStore::<Order, _>::builder(storage.clone())
            .projection(summary_projection(ProjectionStore::Selected))
            .build()
            .unwrap();

        let a = placed_order(&store, 1).await; // seq 1..=2
        let b = placed_order(&store, 1).await; // seq 3..=4
        let c = placed_order(&store, 0).await; // seq 5

        let b_id = AggregateId::parse(b.as_str()).unwrap();
        storage.faults.fail_sink_saves_for.lock().unwrap().insert(b_id.clone());

        let catch_up = store.catch_up(100);
        assert!(catch_up.run_once(OrderSummaryProjection::NAME).await.is_err());
        let checkpoint = store
            .checkpoints()
            .load(OrderSummaryProjection::NAME, CheckpointType::Projection)
            .await
            .unwrap();
        assert_eq!(checkpoint.seq(), 2);
        assert!(store.project::<OrderSummary>(&a).await.unwrap().is_some());

        storage.faults.fail_sink_saves_for.lock().unwrap().clear();
        let report = catch_up.run_once(OrderSummaryProjection::NAME).await.unwrap();
        assert_eq!(report.from, 2);
        assert_eq!(report.to, 5);
        assert_eq!(report.envelopes, 3);

        for id in [&a, &b, &c] {
            assert!(store.project::<OrderSummary>(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn reset_rebuilds_records_without_double_application() {
        let storage = InMemoryStorage::new();
        let store = EventStore::<Order, _>::builder(storage.clone())
            .projection(summary_projection(ProjectionStore::Selected))
            .build()
            .unwrap();
        let id = placed_order(&store, 2).await;
        let aggregate_id = AggregateId::parse(id.as_str()).unwrap();

        let catch_up = store.catch_up(100);
        catch_up.run_once(OrderSummaryProjection::NAME).await.unwrap();

        // Drift the stored record without changing its version.
        let mut record = ProjectionSink::load_record(&storage, &aggregate_id, OrderSummaryProjection::NAME)
            .await
            .unwrap()
            .unwrap();
        record.data["item_count"] = serde_json::json!(99);
        ProjectionSink::save_record(&storage, &record).await.unwrap();
        let drifted: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(drifted.item_count, 99);

        assert_eq!(catch_up.reset(OrderSummaryProjection::NAME).await.unwrap(), 1);
        let report = catch_up.run_once(OrderSummaryProjection::NAME).await.unwrap();
        assert_eq!(report.from, 0);
        assert_eq!(report.records_written, 1);

        let summary: OrderSummary = store.project(&id).await.unwrap().unwrap();
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.total_quantity, 2);
    }

    #[tokio::test]
    async fn concurrent_catch_up_passes_never_roll_the_checkpoint_back() {
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .projection(summary_projection(ProjectionStore::Selected))
            .build()
            .unwrap();
        placed_order(&store, 1).await; // seq 1..=2
        placed_order(&store, 1).await; // seq 3..=4

        let tracker = store.checkpoints();
        let stale = tracker
            .load(OrderSummaryProjection::NAME, CheckpointType::Projection)
            .await
            .unwrap();

        store.catch_up(100).run_once(OrderSummaryProjection::NAME).await.unwrap();

        // A slower pass that started from the same cursor confirms only its first run.
        let mut behind = stale.bounded(4, 100);
        behind.advance(2).unwrap();
        tracker.save(&behind, false).await.unwrap();

        let checkpoint = tracker
            .load(OrderSummaryProjection::NAME, CheckpointType::Projection)
            .await
            .unwrap();
        assert_eq!(checkpoint.seq(), 4);
    }

    #[tokio::test]
    async fn selected_projection_is_filled_by_backfill_only() {
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .projection(summary_projection(ProjectionStore::Selected))
            .build()
            .unwrap();
        let chosen = placed_order(&store, 1).await;
        let other = placed_order(&store, 1).await;

        assert!(store.project::<OrderSummary>(&chosen).await.unwrap().is_none());

        let sources = [AggregateId::parse(chosen.as_str()).unwrap()];
        let written = store.restore_projection(OrderSummaryProjection::NAME, &sources).await.unwrap();

        assert_eq!(written, 1);
        assert!(store.project::<OrderSummary>(&chosen).await.unwrap().is_some());
        assert!(store.project::<OrderSummary>(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn projection_worker_updates_documents_after_commit() {
        let bus = Arc::new(InMemoryEventBus::<EventSourceEnvelope>::new());
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .projection(summary_projection(ProjectionStore::Document))
            .bus(bus.clone())
            .build()
            .unwrap();
        let worker = ProjectionWorker::documents(bus.as_ref(), store.applier().clone(), Arc::clone(store.projections()));

        let id = placed_order(&store, 2).await;

        let mut summary = None;
        for _ in 0..50 {
            summary = store.project::<OrderSummary>(&id).await.unwrap();
            if summary.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown().await;

        assert_eq!(summary.map(|s| s.item_count), Some(2));
    }

    #[tokio::test]
    async fn failed_notification_does_not_fail_the_commit() {
        let store = EventStore::<Order, _>::builder(InMemoryStorage::new())
            .bus(Arc::new(ClosedBus))
            .build()
            .unwrap();

        let id = placed_order(&store, 1).await;
        let order = store.create_or_restore(Some(&id)).await.unwrap();
        assert_eq!(order.version(), 2);
    }

    #[tokio::test]
    async fn concurrent_init_source_is_idempotent() {
        let store = consistent_store(InMemoryStorage::new());
        let (a, b) = tokio::join!(store.init_source(), store.init_source());
        a.unwrap();
        b.unwrap();
        store.init_source().await.unwrap();

        let checkpoint = store
            .checkpoints()
            .load(OrderSummaryProjection::NAME, CheckpointType::Projection)
            .await
            .unwrap();
        assert_eq!(checkpoint.seq(), 0);
    }

    /// Write raw events straight through a unit of work, bypassing the entity runtime.
    async fn seed_raw_stream(storage: &InMemoryStorage, events: Vec<UncommittedEvent>) {
        let mut uow = storage.begin().await.unwrap();
        uow.append(events).await.unwrap();
        uow.commit().await.unwrap();
    }

    fn raw_event(id: &str, aggregate_type: &str, event_type: &str, version: u64, payload: serde_json::Value) -> UncommittedEvent {
        UncommittedEvent {
            tenant_id: eventstorage_core::TenantId::unscoped(),
            aggregate_id: AggregateId::parse(id).unwrap(),
            aggregate_type: aggregate_type.into(),
            event: eventstorage_events::SourcedEvent::from_parts(event_type, 1, version, chrono::Utc::now(), None, payload),
        }
    }

    #[tokio::test]
    async fn restore_of_foreign_stream_is_not_constructible() {
        let storage = InMemoryStorage::new();
        seed_raw_stream(
            &storage,
            vec![raw_event("inv-1", "inventory.item", "inventory.item.created", 1, serde_json::json!({}))],
        )
        .await;

        let store = consistent_store(storage);
        let err = store.create_or_restore(Some("inv-1")).await.unwrap_err();
        assert!(matches!(err, EventStoreError::NotConstructible { .. }));
    }

    #[tokio::test]
    async fn restore_fails_on_event_type_without_handler() {
        let storage = InMemoryStorage::new();
        seed_raw_stream(
            &storage,
            vec![
                raw_event("o-1", Order::AGGREGATE_TYPE, OrderPlaced::EVENT_TYPE, 1, serde_json::json!({ "customer": "acme" })),
                raw_event("o-1", Order::AGGREGATE_TYPE, "sales.order.teleported", 2, serde_json::json!({})),
            ],
        )
        .await;

        let store = consistent_store(storage);
        let err = store.create_or_restore(Some("o-1")).await.unwrap_err();
        assert!(!err.is_retryable());
        match err {
            EventStoreError::UnhandledEventType { event_type, .. } => assert_eq!(event_type, "sales.order.teleported"),
            other => panic!("expected UnhandledEventType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restore_fails_on_undecodable_payload() {
        let storage = InMemoryStorage::new();
        seed_raw_stream(
            &storage,
            vec![
                raw_event("o-2", Order::AGGREGATE_TYPE, OrderPlaced::EVENT_TYPE, 1, serde_json::json!({ "customer": "acme" })),
                raw_event("o-2", Order::AGGREGATE_TYPE, ItemAdded::EVENT_TYPE, 2, serde_json::json!({ "sku": 7 })),
            ],
        )
        .await;

        let store = consistent_store(storage);
        let err = store.create_or_restore(Some("o-2")).await.unwrap_err();
        assert!(matches!(err, EventStoreError::SerializationFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn dispatcher_retries_through_a_conflict() {
        let storage = FaultyStorage::default();
        let store = Arc::new(consistent_store(storage.clone()));
        let id = placed_order(&store, 0).await;
        let dispatcher = CommandDispatcher::new(Arc::clone(&store), 3);

        storage.faults.append_conflicts.store(1, Ordering::SeqCst);
        let mut attempts = 0;
        dispatcher
            .dispatch(Some(&id), |order: &mut Entity<Order>| {
                attempts += 1;
                order.add_item("sku-1", 1, 10)
            })
            .await
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(store.create_or_restore(Some(&id)).await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn dispatcher_gives_up_after_budget() {
        let storage = FaultyStorage::default();
        let store = Arc::new(consistent_store(storage.clone()));
        let id = placed_order(&store, 0).await;
        let dispatcher = CommandDispatcher::new(Arc::clone(&store), 3);

        storage.faults.append_conflicts.store(10, Ordering::SeqCst);
        let err = dispatcher
            .dispatch(Some(&id), |order: &mut Entity<Order>| order.add_item("sku-1", 1, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(store.load_max_sequence().await.unwrap(), 1);
    }
}
