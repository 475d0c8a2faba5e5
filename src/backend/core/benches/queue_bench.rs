//! Benchmarks for the in-memory job store and worker loop
//!
//! Run with: cargo bench

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use inspector_core::config::JobDefaults;
use inspector_core::handlers::normalize_regulation_number;
use inspector_core::jobs::{
    EnqueueOptions, ExponentialBackoff, HandlerRegistry, InMemoryJobStore, JobContext,
    JobEnqueuer, JobHandler, JobResult, JobStore, WorkerConfig, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    fn job_type(&self) -> &'static str {
        "noop"
    }

    async fn handle(&self, _ctx: &JobContext, _payload: &[u8]) -> JobResult {
        Ok(())
    }
}

/// Benchmark enqueue followed by lease for a backlog of jobs.
fn bench_enqueue_lease(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("enqueue_lease");

    for backlog in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let store = Arc::new(InMemoryJobStore::new());
                let enqueuer = JobEnqueuer::new(store.clone(), JobDefaults::default());
                for i in 0..count {
                    enqueuer
                        .enqueue("noop", &serde_json::json!({ "i": i }), EnqueueOptions::new())
                        .await
                        .unwrap();
                }
                let mut leased = 0;
                while store.lease_next().await.unwrap().is_some() {
                    leased += 1;
                }
                black_box(leased)
            });
        });
    }
    group.finish();
}

/// Benchmark draining a backlog through `process_next`.
fn bench_process_next(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("process_next");

    for backlog in [10, 100].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), backlog, |b, &count| {
            b.to_async(&runtime).iter(|| async move {
                let store = Arc::new(InMemoryJobStore::new());
                let registry = HandlerRegistry::builder().register(Arc::new(NoopHandler)).build();
                let pool = WorkerPool::new(store.clone(), Arc::new(registry), WorkerConfig::default());
                let enqueuer = JobEnqueuer::new(store, JobDefaults::default());
                for _ in 0..count {
                    enqueuer
                        .enqueue_raw("noop", Vec::new(), EnqueueOptions::new())
                        .await
                        .unwrap();
                }
                while pool.process_next().await.unwrap().is_some() {}
            });
        });
    }
    group.finish();
}

/// Benchmark backoff delay computation.
fn bench_backoff(c: &mut Criterion) {
    let backoff = ExponentialBackoff::new(Duration::from_secs(1)).with_max(Duration::from_secs(3600));
    c.bench_function("backoff_delay", |b| {
        b.iter(|| {
            for attempt in 1..=20u32 {
                black_box(backoff.delay_for_attempt(black_box(attempt)));
            }
        });
    });
}

/// Benchmark regulation number normalization.
fn bench_regulation_normalization(c: &mut Criterion) {
    let inputs = [
        "29 CFR 1926.501 (b)(1)",
        "OSHA 1910.23(A)( 2 )",
        "1926.1053",
        "general duty clause",
    ];
    c.bench_function("normalize_regulation_number", |b| {
        b.iter(|| {
            for input in &inputs {
                black_box(normalize_regulation_number(black_box(input)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue_lease,
    bench_process_next,
    bench_backoff,
    bench_regulation_normalization
);
criterion_main!(benches);
