//! Registry and error-context table operations without a kernel.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tidreg_core::{ErrnoTable, Priority, Reap, Registry, ThreadRecord, ThreadStack, Tid};

fn record(tid: u32) -> ThreadRecord {
    let stack = ThreadStack::allocate(256).expect("stack");
    ThreadRecord::new("bench", Priority::DEFAULT, stack).with_tid(Tid(tid))
}

fn populated(n: u32, contexts: &ErrnoTable) -> Registry {
    let registry = Registry::new();
    for tid in 1..=n {
        registry.register(record(tid), contexts);
    }
    registry
}

fn bench_register_reap(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_reap");

    for &live in &[0u32, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("live", live), &live, |b, &n| {
            let contexts = ErrnoTable::new();
            let registry = populated(n, &contexts);
            let tid = n + 1;
            b.iter(|| {
                registry.register(record(tid), &contexts);
                if let Reap::Evicted(mut old) = registry.reap(Tid(tid))
                    && let Some(ctx) = old.take_error_context()
                {
                    contexts.detach(ctx);
                }
            });
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let contexts = ErrnoTable::new();
    let registry = populated(1024, &contexts);
    let mut group = c.benchmark_group("lookup");

    group.bench_function("contains_hit", |b| {
        b.iter(|| criterion::black_box(registry.contains(Tid(512))));
    });
    group.bench_function("contains_miss", |b| {
        b.iter(|| criterion::black_box(registry.contains(Tid(4096))));
    });
    group.bench_function("find_view", |b| {
        b.iter(|| criterion::black_box(registry.find(Tid(700))));
    });
    group.bench_function("errno_slot", |b| {
        b.iter(|| criterion::black_box(contexts.slot(Tid(300))));
    });
    group.finish();
}

fn bench_stale_eviction(c: &mut Criterion) {
    let contexts = ErrnoTable::new();
    let registry = populated(64, &contexts);
    let mut group = c.benchmark_group("stale");

    group.bench_function("reregister_then_absorb", |b| {
        b.iter(|| {
            let stale = registry.register(record(32), &contexts);
            criterion::black_box(stale);
            criterion::black_box(registry.reap(Tid(32)));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_register_reap, bench_lookup, bench_stale_eviction);
criterion_main!(benches);
