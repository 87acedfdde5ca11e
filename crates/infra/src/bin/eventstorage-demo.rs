//! Runs the order scenario against the configured backend and prints the summary.
//!
//! `DATABASE_URL` selects Postgres; otherwise everything stays in memory.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use eventstorage_core::AggregateRoot;
use eventstorage_events::{EventSourceEnvelope, InMemoryEventBus};
use eventstorage_infra::{
    CatchUpWorker, EngineConfig, EventStore, InMemoryDocumentStore, InMemoryStorage, PostgresStorage, ProjectionSink,
    ProjectionWorker, StorageDriver,
};
use eventstorage_sales::{Order, OrderCommands, OrderSummary, OrderSummaryProjection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventstorage_observability::init();

    let config = EngineConfig::from_env().context("reading configuration")?;
    let documents = document_store(&config)?;

    match &config.database_url {
        Some(url) => {
            let storage = PostgresStorage::connect(url, config.db_max_connections)
                .await
                .context("connecting to Postgres")?;
            run(storage, documents, &config).await
        }
        None => run(InMemoryStorage::new(), documents, &config).await,
    }
}

#[cfg(feature = "redis")]
fn document_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn ProjectionSink>> {
    use eventstorage_infra::read_model::RedisDocumentStore;

    Ok(match &config.redis_url {
        Some(url) => Arc::new(RedisDocumentStore::new(url, "eventstorage").context("opening Redis")?),
        None => Arc::new(InMemoryDocumentStore::new()),
    })
}

#[cfg(not(feature = "redis"))]
fn document_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn ProjectionSink>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the `redis` feature is disabled; using the in-memory document store");
    }
    Ok(Arc::new(InMemoryDocumentStore::new()))
}

async fn run<D>(driver: D, documents: Arc<dyn ProjectionSink>, config: &EngineConfig) -> anyhow::Result<()>
where
    D: StorageDriver + Clone + 'static,
{
    let bus = Arc::new(InMemoryEventBus::<EventSourceEnvelope>::new());
    let store = EventStore::<Order, D>::builder(driver)
        .projection(OrderSummaryProjection::default())
        .documents(documents)
        .bus(bus.clone())
        .tenant(config.tenant_id)
        .build()?;
    store.init_source().await?;

    let listener = ProjectionWorker::documents(bus.as_ref(), store.applier().clone(), Arc::clone(store.projections()));
    let catch_up = CatchUpWorker::spawn(store.catch_up(config.catch_up_batch_size), config.catch_up_interval);

    let mut order = store.create_or_restore(None).await?;
    order.place("acme")?;
    order.add_item("sku-1", 2, 150)?;
    store.commit(&mut order).await?;

    let id = order.id().as_str().to_string();
    let mut order = store.create_or_restore(Some(&id)).await?;
    order.add_item("sku-2", 1, 40)?;
    order.confirm()?;
    store.commit(&mut order).await?;
    info!(aggregate_id = %id, version = order.version(), "order confirmed");

    let summary: OrderSummary = store
        .project(&id)
        .await?
        .context("order summary missing after commit")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    listener.shutdown().await;
    catch_up.shutdown().await;
    Ok(())
}
