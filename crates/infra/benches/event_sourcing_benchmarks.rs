use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use cairn_core::{Entity, EntityId, RequestId};
use cairn_events::{EventEnvelope, InMemoryEventBus, ReadModelChange, Registry, StreamKey, encode, fold_entity};
use cairn_infra::{InMemoryEventStore, InMemoryReadModelStore, RetryPolicy, Runtime, RuntimeConfig};
use cairn_shop::{Cart, CartItemChanged, PaymentConfirmed};
use chrono::Utc;
use std::sync::Arc;

type BenchRuntime = Runtime<InMemoryEventStore, InMemoryReadModelStore, Arc<InMemoryEventBus<ReadModelChange>>>;

fn shop_registry() -> Arc<Registry> {
    Arc::new(cairn_shop::registry().unwrap())
}

fn item_changed(cart_id: &str, n: usize) -> EventEnvelope {
    let event = CartItemChanged {
        cart_id: EntityId::from(cart_id),
        product_id: format!("p{}", n % 16),
        quantity: (n % 5) as u32 + 1,
    };
    EventEnvelope::event(&event, RequestId::new()).unwrap()
}

/// `len` contiguous, already-versioned events for one cart.
fn cart_stream(cart_id: &str, len: usize) -> Vec<EventEnvelope> {
    (0..len)
        .map(|n| {
            let mut e = item_changed(cart_id, n);
            e.version = n as u64 + 1;
            e
        })
        .collect()
}

fn runtime(snapshot_interval: u64) -> BenchRuntime {
    let mut config = RuntimeConfig::default();
    config.event_store.snapshot_interval = snapshot_interval;
    config.event_store.append_retry = RetryPolicy::immediate(3);
    config.projections.retry = RetryPolicy::immediate(3);
    Runtime::new(
        config,
        shop_registry(),
        InMemoryEventStore::new(),
        InMemoryReadModelStore::new(),
        Arc::new(InMemoryEventBus::new()),
    )
    .unwrap()
}

fn tokio_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

/// Pure fold cost: full replay vs resuming from a snapshot at the midpoint.
fn bench_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold_entity");
    let registry = shop_registry();
    let stream = StreamKey::new(Cart::TYPE_NAME, EntityId::from("cart-1"));

    for len in [10usize, 100, 1000] {
        let events = cart_stream("cart-1", len);
        group.throughput(Throughput::Elements(len as u64));

        group.bench_with_input(BenchmarkId::new("from_scratch", len), &events, |b, events| {
            b.iter(|| black_box(fold_entity(&registry, &stream, None, events).unwrap()));
        });

        let (prefix, suffix) = events.split_at(len / 2);
        let snapshot = fold_entity(&registry, &stream, None, prefix)
            .unwrap()
            .map(|f| f.snapshot)
            .unwrap();
        group.bench_with_input(BenchmarkId::new("from_snapshot", len), &suffix, |b, suffix| {
            b.iter(|| black_box(fold_entity(&registry, &stream, Some(&snapshot), suffix).unwrap()));
        });
    }

    group.finish();
}

/// Whole pipeline per batch: decode, append, snapshot, project, notify.
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let rt = tokio_runtime();

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("single_cart", batch_size), &batch_size, |b, &size| {
            let runtime = runtime(1);
            let mut round = 0usize;
            b.iter(|| {
                round += 1;
                let batch: Vec<_> = (0..size).map(|n| item_changed("cart-1", round * size + n)).collect();
                let raw = encode(&batch).unwrap();
                black_box(rt.block_on(runtime.dispatch_event(&raw)).unwrap());
            });
        });

        group.bench_with_input(BenchmarkId::new("many_carts", batch_size), &batch_size, |b, &size| {
            let runtime = runtime(1);
            let mut round = 0usize;
            b.iter(|| {
                round += 1;
                let batch: Vec<_> = (0..size)
                    .map(|n| item_changed(&format!("cart-{round}-{n}"), n))
                    .collect();
                let raw = encode(&batch).unwrap();
                black_box(rt.block_on(runtime.dispatch_event(&raw)).unwrap());
            });
        });
    }

    group.finish();
}

/// Payments joining onto existing cart read models (cross-entity projection).
fn bench_cross_entity_projection(c: &mut Criterion) {
    let rt = tokio_runtime();
    let runtime = runtime(1);
    let carts: Vec<_> = (0..100).map(|n| item_changed(&format!("cart-{n}"), n)).collect();
    rt.block_on(runtime.dispatch_event(&encode(&carts).unwrap())).unwrap();

    let mut round = 0usize;
    c.bench_function("payment_onto_cart_read_model", |b| {
        b.iter(|| {
            round += 1;
            let payment = PaymentConfirmed {
                payment_id: EntityId::from(format!("pay-{round}")),
                cart_id: EntityId::from(format!("cart-{}", round % 100)),
                payment_method: "card".to_string(),
                amount_cents: 1_000,
                confirmed_at: Utc::now(),
            };
            let raw = encode(&[EventEnvelope::event(&payment, RequestId::new()).unwrap()]).unwrap();
            black_box(rt.block_on(runtime.dispatch_event(&raw)).unwrap());
        });
    });
}

criterion_group!(benches, bench_fold, bench_dispatch, bench_cross_entity_projection);
criterion_main!(benches);
