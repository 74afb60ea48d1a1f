//! Shared store hot-path benchmarks

use cell_store::{CommandConsumer, CommandProducer, Params, SharedStore};
use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use std::hint::black_box;

/// Benchmark single-key get/set with a populated map
fn bench_get_set(c: &mut Criterion) {
    let store = SharedStore::new();
    for i in 0..256 {
        store.set(&format!("io/di/pin_{i}"), i % 2 == 0);
    }

    c.bench_function("store_get_bool", |b| {
        b.iter(|| black_box(store.get_bool(black_box("io/di/pin_17"))));
    });

    let mut flip = false;
    c.bench_function("store_set_bool", |b| {
        b.iter(|| {
            flip = !flip;
            store.set(black_box("io/di/pin_42"), flip);
        });
    });

    c.bench_function("store_update_counter", |b| {
        b.iter(|| {
            store.update("comm/io/failures", |v| {
                *v = json!(v.as_i64().unwrap_or(0) + 1);
            })
        });
    });
}

/// Benchmark one full command channel exchange
fn bench_command_round_trip(c: &mut Criterion) {
    let store = SharedStore::new();
    let mut producer = CommandProducer::new(store.clone(), "command/robot");
    let consumer = CommandConsumer::new(store, "command/robot");
    let mut params = Params::new();
    params.insert("target_floor".into(), json!(2));

    c.bench_function("command_round_trip", |b| {
        b.iter(|| {
            let id = producer.issue("MOVE_TO_RACK", params.clone()).unwrap();
            consumer.complete(id, None).unwrap();
            black_box(producer.poll_completion().unwrap());
        });
    });
}

criterion_group!(benches, bench_get_set, bench_command_round_trip);
criterion_main!(benches);
