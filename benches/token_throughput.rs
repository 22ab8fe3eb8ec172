//! Token store and event bus throughput benchmarks.
//!
//! Measures publish/consume cycles on the scheduler's token store and
//! publish fan-out on the event bus using Criterion.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use dipeo_core::engine::TokenStore;
use dipeo_core::envelope::Envelope;
use dipeo_core::events::{EventBus, EventKind};
use dipeo_core::types::{EdgeId, EngineConfig, ExecutionId, NodeId};

fn envelope() -> Arc<Envelope> {
    Arc::new(Envelope::from_text(
        "payload",
        NodeId::from("bench"),
        ExecutionId::from("bench-exec"),
    ))
}

fn bench_token_publish_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_publish_consume");
    for &edges in &[1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(edges), &edges, |b, &edges| {
            let edge_ids: Vec<EdgeId> = (0..edges)
                .map(|i| EdgeId::from(format!("edge-{i}").as_str()))
                .collect();
            let payload = envelope();
            b.iter(|| {
                let mut store = TokenStore::new();
                for edge in &edge_ids {
                    store.publish(black_box(edge), 0, Arc::clone(&payload));
                }
                for edge in &edge_ids {
                    black_box(store.consume_earliest(edge, 0));
                }
            });
        });
    }
    group.finish();
}

fn bench_bus_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("bus_publish");
    for &subscribers in &[0usize, 1, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                let mut config = EngineConfig::default();
                config.keepalive_interval = Duration::from_secs(3600);
                config.subscriber_outbox_max = 1 << 16;
                let (bus, id, _subs) = rt.block_on(async {
                    let bus = EventBus::new(&config);
                    let id = ExecutionId::from("bench");
                    bus.register_execution(id.clone(), None);
                    let subs: Vec<_> = (0..subscribers)
                        .map(|_| bus.subscribe(&id, None).unwrap())
                        .collect();
                    (bus, id, subs)
                });
                b.iter(|| {
                    bus.publish(&id, black_box(EventKind::KeepAlive { latest_seq: 0 }));
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_token_publish_consume, bench_bus_publish);
criterion_main!(benches);
