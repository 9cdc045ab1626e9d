//! Local store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docsync_bench::utils::{generate_documents, random_document};
use docsync_codec::doc;
use docsync_storage::{FileStore, LocalStore, MemoryStore};
use tempfile::TempDir;

/// Benchmark single inserts into each store.
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_one");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memory", |b| {
        let store = MemoryStore::new();
        let mut id = 0i64;
        b.iter(|| {
            id += 1;
            store.insert_one("bench", "docs", random_document(id, 8)).unwrap();
        });
    });

    group.bench_function("file_no_sync", |b| {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap().with_sync_writes(false);
        let mut id = 0i64;
        b.iter(|| {
            id += 1;
            store.insert_one("bench", "docs", random_document(id, 8)).unwrap();
        });
    });

    group.finish();
}

/// Benchmark filtered finds over collections of growing size.
fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_filtered");

    for count in [100, 1000, 10000].iter() {
        let store = MemoryStore::new();
        store
            .insert_many("bench", "docs", generate_documents(*count, 8))
            .unwrap();
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &store, |b, store| {
            let filter = doc! { "_id" => doc! { "$lt" => 50i64 }, "f2" => true };
            b.iter(|| black_box(store.find("bench", "docs", black_box(&filter)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark `$set` updates by `_id`.
fn bench_update(c: &mut Criterion) {
    let store = MemoryStore::new();
    store
        .insert_many("bench", "docs", generate_documents(1000, 8))
        .unwrap();
    let mut n = 0i64;
    c.bench_function("update_one_by_id", |b| {
        b.iter(|| {
            n += 1;
            let filter = doc! { "_id" => n % 1000 };
            let update = doc! { "$set" => doc! { "f0" => n } };
            black_box(store.update_one("bench", "docs", &filter, &update, false).unwrap());
        });
    });
}

/// Benchmark reopening a file store, which replays its log.
fn bench_file_reopen(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_reopen");
    group.sample_size(20);

    for count in [100, 1000].iter() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap().with_sync_writes(false);
            for document in generate_documents(*count, 8) {
                store.insert_one("bench", "docs", document).unwrap();
            }
        }
        group.bench_with_input(BenchmarkId::from_parameter(count), &dir, |b, dir| {
            b.iter(|| black_box(FileStore::open(dir.path()).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_find, bench_update, bench_file_reopen);

criterion_main!(benches);
