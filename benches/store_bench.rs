//! Chunk store benchmarks using criterion.
//!
//! Run with: cargo bench --bench store_bench

use chunkstore::{ChunkStore, LockTimeout, StoreConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_store() -> ChunkStore {
    ChunkStore::new(
        StoreConfig::builder()
            .heap_capacity(256 << 20)
            .build()
            .unwrap(),
    )
    .unwrap()
}

fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    for size in [64usize, 1024, 16384] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let store = bench_store();
            b.iter(|| {
                let cid = store.create(black_box(size)).unwrap();
                store.remove(cid, LockTimeout::Infinite).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_get_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_put");

    for size in [64usize, 1024, 16384] {
        let store = bench_store();
        let cid = store.create(size).unwrap();
        let data = vec![0x5Au8; size];
        let mut buf = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("put", size), &size, |b, _| {
            b.iter(|| {
                store
                    .put(black_box(cid), &data, LockTimeout::Infinite)
                    .unwrap()
            });
        });
        group.bench_with_input(BenchmarkId::new("get", size), &size, |b, _| {
            b.iter(|| {
                store
                    .get(black_box(cid), &mut buf, LockTimeout::Infinite)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_translate_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_path");

    let store = bench_store();
    let cid = store.create(64).unwrap();

    group.bench_function("exists", |b| {
        b.iter(|| black_box(store.exists(black_box(cid))));
    });
    group.bench_function("size", |b| {
        b.iter(|| store.size(black_box(cid), LockTimeout::Infinite).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_create, bench_get_put, bench_translate_lock);
criterion_main!(benches);
