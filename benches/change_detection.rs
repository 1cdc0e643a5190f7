//! Benchmarks for change detection and the duplicate scan

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use metrics_retention::models::{PostKey, PostMetrics, PostMetricsSnapshot};
use metrics_retention::tasks::cleanup::consecutive_duplicates;
use metrics_retention::tracker::{Materiality, MetricsChangeTracker};

fn bench_is_material(c: &mut Criterion) {
    let mut group = c.benchmark_group("materiality");
    group.throughput(Throughput::Elements(1000));

    let previous = PostMetrics::new(10_000, 120, 40, 900);
    let exact = Materiality::default();
    let relative = Materiality::new(5, 1.0);

    group.bench_function("exact_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let current = PostMetrics::new(10_000 + i % 3, 120, 40, 900);
                black_box(exact.is_material(Some(&previous), &current));
            }
        });
    });

    group.bench_function("relative_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let current = PostMetrics::new(10_000 + i, 120, 40, 900);
                black_box(relative.is_material(Some(&previous), &current));
            }
        });
    });

    group.finish();
}

fn bench_record_check(c: &mut Criterion) {
    let tracker = MetricsChangeTracker::default();
    let key = PostKey::new(-1001, 42);
    let previous = PostMetrics::new(500, 3, 1, 20);
    let start = Utc::now();

    c.bench_function("record_check_sequence_100", |b| {
        b.iter(|| {
            let mut record = None;
            for i in 0..100 {
                let current = PostMetrics::new(500 + i / 10, 3, 1, 20);
                let (next, decision) = tracker.record_check(
                    record,
                    key,
                    &current,
                    Some(&previous),
                    start + Duration::minutes(i),
                    Some(1.5),
                );
                black_box(decision);
                record = Some(next);
            }
        });
    });
}

fn bench_duplicate_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_scan");
    group.throughput(Throughput::Elements(10_000));

    let start = Utc::now();
    let page: Vec<PostMetricsSnapshot> = (0..10_000)
        .map(|i| {
            PostMetricsSnapshot::new(
                PostKey::new(1, i / 100),
                start + Duration::minutes(i % 100),
                PostMetrics::new(i / 7, 0, 0, 0),
            )
        })
        .collect();

    group.bench_function("page_10000", |b| {
        b.iter(|| black_box(consecutive_duplicates(None, black_box(&page))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_is_material,
    bench_record_check,
    bench_duplicate_scan
);
criterion_main!(benches);
