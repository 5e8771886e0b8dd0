//! Event store throughput: append path and the scheduler's query shape.

use core_events::{EventStore, MemoryEvent, MemoryEventKind, Stage};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn seeded(iterations: u32, per_iteration: usize) -> EventStore {
    let store = EventStore::new();
    for _ in 0..iterations {
        store.new_iteration();
        for i in 0..per_iteration {
            let kind = if i % 7 == 0 {
                MemoryEventKind::Swapout
            } else {
                MemoryEventKind::Access
            };
            let stage = if i % 2 == 0 {
                Stage::Forward
            } else {
                Stage::Backward
            };
            store.submit(MemoryEvent::new(
                format!("o{}", i % 32),
                format!("t{}", i % 64),
                1024,
                kind,
                stage,
            ));
        }
    }
    store
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("store_append_1k", |b| {
        b.iter(|| {
            let store = EventStore::new();
            store.new_iteration();
            for i in 0..1000 {
                store.submit(MemoryEvent::new(
                    "o1",
                    format!("t{i}"),
                    1024,
                    MemoryEventKind::Access,
                    Stage::Forward,
                ));
            }
            black_box(store.iteration())
        })
    });
}

fn bench_scheduler_query(c: &mut Criterion) {
    let store = seeded(4, 2048);
    c.bench_function("query_iter1_forward_swapouts", |b| {
        b.iter(|| {
            let iter1 = store.select().where_(|(i, _)| *i == 1).get();
            let swapouts = iter1
                .select()
                .where_(|(_, e)| e.kind == MemoryEventKind::Swapout)
                .where_(|(_, e)| e.stage == Stage::Forward)
                .get();
            black_box(swapouts.len())
        })
    });
}

criterion_group!(benches, bench_append, bench_scheduler_query);
criterion_main!(benches);
