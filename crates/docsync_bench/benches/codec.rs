//! Document codec, hashing and diff benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docsync_bench::utils::{edited, random_document};
use docsync_codec::{document_from_cbor, document_hash, document_to_cbor};
use docsync_protocol::{sanitize_document, with_version, UpdateDescription, Version};

/// Benchmark canonical encoding by document size.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_encode");

    for fields in [4, 16, 64, 256].iter() {
        let document = random_document(1, *fields);
        let size = document_to_cbor(&document).unwrap().len();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fields), &document, |b, document| {
            b.iter(|| {
                let bytes = document_to_cbor(black_box(document)).unwrap();
                black_box(bytes);
            });
        });
    }

    group.finish();
}

/// Benchmark decoding by document size.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_decode");

    for fields in [4, 16, 64, 256].iter() {
        let bytes = document_to_cbor(&random_document(1, *fields)).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fields), &bytes, |b, bytes| {
            b.iter(|| {
                let document = document_from_cbor(black_box(bytes)).unwrap();
                black_box(document);
            });
        });
    }

    group.finish();
}

/// Benchmark content hashing.
fn bench_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("document_hash");

    for fields in [4, 64, 256].iter() {
        let document = random_document(1, *fields);
        group.bench_with_input(BenchmarkId::from_parameter(fields), &document, |b, document| {
            b.iter(|| black_box(document_hash(black_box(document))));
        });
    }

    group.finish();
}

/// Benchmark computing update descriptions.
fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_diff");

    for fields in [16, 64, 256].iter() {
        let before = random_document(1, *fields);
        let after = edited(&before, 4);
        group.bench_with_input(
            BenchmarkId::from_parameter(fields),
            &(before, after),
            |b, (before, after)| {
                b.iter(|| {
                    let diff = UpdateDescription::diff(black_box(before), black_box(after));
                    black_box(diff.as_update_document());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark stripping sync metadata.
fn bench_sanitize(c: &mut Criterion) {
    let document = with_version(&random_document(1, 32), &Version::fresh());
    c.bench_function("sanitize_document", |b| {
        b.iter(|| black_box(sanitize_document(black_box(&document))));
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_hash,
    bench_diff,
    bench_sanitize,
);

criterion_main!(benches);
