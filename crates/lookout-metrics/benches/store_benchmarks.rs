//! Benchmarks for lookout-metrics.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lookout_metrics::{Labels, MetricIdentity, SampleStore, Selector, TimeRange};

fn identity(job: &str) -> MetricIdentity {
    MetricIdentity::parse(
        "benchmark_metric",
        Labels::new().with("job", job).with("instance", "host:9100"),
    )
    .unwrap()
}

fn benchmark_write(c: &mut Criterion) {
    let store = SampleStore::with_retention(Duration::from_secs(3600));
    let id = identity("write");
    let mut ts = 0i64;

    c.bench_function("write_single_sample", |b| {
        b.iter(|| {
            ts += 1;
            store.write(&id, ts, black_box(42.0)).unwrap();
        });
    });
}

fn benchmark_appender_batch(c: &mut Criterion) {
    let store = SampleStore::with_retention(Duration::from_secs(3600));
    let ids: Vec<MetricIdentity> = (0..100).map(|i| identity(&format!("job{i}"))).collect();
    let mut ts = 0i64;

    c.bench_function("append_batch_100_series", |b| {
        b.iter(|| {
            ts += 1;
            let mut appender = store.appender();
            for id in &ids {
                appender.append(id, ts, black_box(1.0)).unwrap();
            }
            appender.commit()
        });
    });
}

fn benchmark_query(c: &mut Criterion) {
    let store = SampleStore::with_retention(Duration::from_secs(3600));
    let id = identity("query");

    // Pre-populate with data
    for i in 0..10_000 {
        store.write(&id, i * 100, i as f64).unwrap();
    }

    let selector = Selector::metric(id.name.clone());
    let range = TimeRange::new(500_000, 800_000).unwrap();

    c.bench_function("query_10k_samples", |b| {
        b.iter(|| store.query(&selector, black_box(range)).samples().count());
    });
}

fn benchmark_evict(c: &mut Criterion) {
    c.bench_function("evict_half_of_10k", |b| {
        b.iter_with_setup(
            || {
                let store = SampleStore::with_retention(Duration::from_secs(3600));
                let id = identity("evict");
                for i in 0..10_000 {
                    store.write(&id, i, 1.0).unwrap();
                }
                store
            },
            |store| store.evict_before(black_box(5_000)),
        );
    });
}

criterion_group!(
    benches,
    benchmark_write,
    benchmark_appender_batch,
    benchmark_query,
    benchmark_evict
);
criterion_main!(benches);
