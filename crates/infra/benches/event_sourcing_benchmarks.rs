use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use eventstorage_core::AggregateRoot;
use eventstorage_events::{EventEnvelope, SourcedEvent, engine};
use eventstorage_infra::event_store::{EventStore, InMemoryStorage};
use eventstorage_sales::{Order, OrderCommands, OrderSummaryProjection};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn store(with_projection: bool) -> EventStore<Order, InMemoryStorage> {
    let builder = EventStore::builder(InMemoryStorage::new());
    let builder = if with_projection {
        builder.projection(OrderSummaryProjection::default())
    } else {
        builder
    };
    builder.build().unwrap()
}

/// Commit one order with `lines` items; returns its id.
async fn seed_order(store: &EventStore<Order, InMemoryStorage>, lines: usize) -> String {
    let mut order = store.create_or_restore(None).await.unwrap();
    order.place("acme").unwrap();
    for i in 0..lines {
        order.add_item(&format!("sku-{i}"), 1, 100).unwrap();
    }
    store.commit(&mut order).await.unwrap();
    order.id().as_str().to_string()
}

fn bench_commit_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_latency");
    let rt = runtime();

    for (name, with_projection) in [("events_only", false), ("with_consistent_projection", true)] {
        group.bench_function(name, |b| {
            let store = store(with_projection);
            b.iter(|| rt.block_on(seed_order(&store, black_box(1))));
        });
    }

    group.finish();
}

fn bench_commit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_throughput");
    let rt = runtime();

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64 + 1));
        group.bench_with_input(BenchmarkId::new("batch_commit", batch_size), &batch_size, |b, &size| {
            let store = store(true);
            b.iter(|| rt.block_on(seed_order(&store, size)));
        });
    }

    group.finish();
}

fn bench_restore_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("restore_speed");
    let rt = runtime();

    for event_count in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(event_count as u64));
        group.bench_with_input(BenchmarkId::new("restore", event_count), &event_count, |b, &count| {
            let store = store(false);
            let id = rt.block_on(seed_order(&store, count - 1));

            b.iter(|| {
                let order = rt.block_on(store.create_or_restore(Some(black_box(id.as_str())))).unwrap();
                black_box(order.version());
            });
        });
    }

    group.finish();
}

fn bench_projection_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_replay");
    let rt = runtime();

    for event_count in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("full_replay", event_count), &event_count, |b, &count| {
            let store = store(false);
            let id = rt.block_on(seed_order(&store, count - 1));
            let order = rt.block_on(store.create_or_restore(Some(&id))).unwrap();
            let events: Vec<SourcedEvent> = order.event_stream().to_vec();
            let projection = OrderSummaryProjection::transient();

            b.iter(|| engine::project(&projection, black_box(&events)).unwrap());
        });
    }

    group.finish();
}

fn bench_range_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_scan");
    let rt = runtime();
    let store = store(false);
    for _ in 0..100 {
        rt.block_on(seed_order(&store, 9));
    }

    group.bench_function("past_checkpoint_1000", |b| {
        let checkpoint = eventstorage_events::Checkpoint::from_parts(
            "bench",
            0,
            1000,
            eventstorage_events::CheckpointType::Projection,
        );
        b.iter(|| {
            let envelopes: Vec<EventEnvelope> = rt
                .block_on(store.load_events_past_checkpoint(black_box(&checkpoint)))
                .unwrap();
            black_box(envelopes.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_commit_latency,
    bench_commit_throughput,
    bench_restore_speed,
    bench_projection_replay,
    bench_range_scan
);
criterion_main!(benches);
