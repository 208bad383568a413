//! Deduplication benchmarks
//!
//! Measures hashing and admission cost of the dedup cache.

use chrono::{TimeZone, Utc};
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::{Duration, Instant};
use tulva_pipeline::dedup::Deduplicator;
use tulva_pipeline::{DataPoint, DataType, Priority};

fn make_point(i: usize) -> DataPoint {
    let ts = Utc
        .timestamp_millis_opt(1_700_000_000_000 + i as i64 * 250)
        .single()
        .unwrap_or_else(Utc::now);
    DataPoint::new("bench", DataType::MarketData, Priority::Critical, ts)
        .with_symbol("AAPL")
        .with_field("price", 180.0 + i as f64 / 100.0)
        .with_field("size", i as i64)
        .with_field("venue", "XNAS")
}

fn make_points(count: usize) -> Vec<DataPoint> {
    (0..count).map(make_point).collect()
}

fn bench_hash_key(c: &mut Criterion) {
    let point = make_point(42);
    c.bench_function("hash_key", |b| {
        b.iter(|| black_box(&point).hash_key(Duration::from_secs(1)))
    });
}

fn bench_admit_unique(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_admit_unique");

    for count in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("points_{count}"), |b| {
            let points = make_points(count);
            b.iter_batched(
                || Deduplicator::new(Duration::from_secs(300)),
                |dedup| {
                    for point in &points {
                        black_box(dedup.admit(point));
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_admit_duplicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_admit_duplicates");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("all_seen", |b| {
        let dedup = Deduplicator::new(Duration::from_secs(300));
        let points = make_points(1_000);
        for point in &points {
            dedup.admit(point);
        }

        b.iter(|| {
            for point in &points {
                black_box(dedup.admit(point));
            }
        })
    });

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    c.bench_function("dedup_sweep_evict_10k_to_1k", |b| {
        b.iter_batched(
            || {
                let dedup = Deduplicator::with_limits(Duration::from_secs(300), Duration::from_secs(1), 1_000);
                for point in make_points(10_000) {
                    dedup.admit(&point);
                }
                dedup
            },
            |dedup| dedup.sweep(Instant::now()),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(
    benches,
    bench_hash_key,
    bench_admit_unique,
    bench_admit_duplicates,
    bench_sweep
);
criterion_main!(benches);
