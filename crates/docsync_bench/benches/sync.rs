//! Sync pass benchmarks.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use docsync_bench::utils::generate_documents;
use docsync_engine::{DataSynchronizer, MockRemoteService, SyncConfig};
use docsync_protocol::{MongoNamespace, RemoteWins};
use docsync_storage::MemoryStore;

fn namespace() -> MongoNamespace {
    MongoNamespace::new("bench", "docs")
}

fn engine() -> (DataSynchronizer, Arc<MockRemoteService>) {
    let remote = Arc::new(MockRemoteService::new());
    let engine = DataSynchronizer::new(
        SyncConfig::new("bench").with_worker_enabled(false),
        Arc::new(MemoryStore::new()),
        remote.clone(),
    )
    .unwrap();
    engine
        .configure(&namespace(), Arc::new(RemoteWins), None, None)
        .unwrap();
    (engine, remote)
}

/// Benchmark a pass that pushes `count` pending inserts.
fn bench_push_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("pass_push_inserts");
    group.sample_size(20);

    for count in [10, 100, 500].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter_batched(
                || {
                    let (engine, remote) = engine();
                    engine
                        .insert_many(&namespace(), generate_documents(count, 8))
                        .unwrap();
                    (engine, remote)
                },
                |(engine, _remote)| engine.do_sync_pass().unwrap(),
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

/// Benchmark a pass with nothing to do over `count` synced documents.
fn bench_idle_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("pass_idle");

    for count in [10, 100, 500].iter() {
        let (engine, _remote) = engine();
        engine
            .insert_many(&namespace(), generate_documents(*count, 8))
            .unwrap();
        engine.do_sync_pass().unwrap();
        engine.do_sync_pass().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &engine, |b, engine| {
            b.iter(|| engine.do_sync_pass().unwrap());
        });
    }

    group.finish();
}

/// Benchmark local writes recorded as pending.
fn bench_local_write(c: &mut Criterion) {
    let (engine, _remote) = engine();
    engine
        .insert_many(&namespace(), generate_documents(1000, 8))
        .unwrap();
    let mut n = 0i64;
    c.bench_function("local_update_one", |b| {
        b.iter(|| {
            n += 1;
            let filter = docsync_codec::doc! { "_id" => n % 1000 };
            let update = docsync_codec::doc! { "$set" => docsync_codec::doc! { "f0" => n } };
            engine.update_one(&namespace(), &filter, &update, false).unwrap()
        });
    });
}

criterion_group!(benches, bench_push_inserts, bench_idle_pass, bench_local_write);

criterion_main!(benches);
