//! Harness overhead benchmarks
//!
//! Measures the cost the runner adds around each cycle, using the in-process
//! fake factory so no network is involved:
//! - Per-cycle overhead in sync and concurrent modes
//! - Scaling with concurrency width
//! - Cost of a memory sample (read, reclaim, read)
//! - Reply decoding
//!
//! Run with: cargo bench --bench cycle_benchmarks

use bytes::BytesMut;
use conn_churn::connection::ConnectionConfig;
use conn_churn::harness::{ExecutionMode, LifecycleRunner, MemoryMetric, MemorySampler, RunPhase};
use conn_churn::protocol::decode_reply;
use conn_churn::testing::{FailureMode, FakeBehavior, FakeFactory};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

const CYCLES: u64 = 1_000;

fn runner(behavior: FakeBehavior) -> LifecycleRunner<FakeFactory> {
    let config = ConnectionConfig::builder("fake.invalid", "bench")
        .build()
        .expect("valid config");
    LifecycleRunner::new(Arc::new(FakeFactory::new(behavior)), Arc::new(config))
        .progress_interval(0)
}

// ============================================================================
// Cycle overhead
// ============================================================================

fn cycle_benchmarks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("cycles");
    group.throughput(Throughput::Elements(CYCLES));

    for mode in [ExecutionMode::Sync, ExecutionMode::Concurrent] {
        let runner = runner(FakeBehavior::default());
        let phase = RunPhase::new(mode.to_string(), mode, CYCLES, Duration::ZERO);
        let (runner, phase) = (&runner, &phase);
        group.bench_function(BenchmarkId::new("clean", mode), |b| {
            b.to_async(&rt)
                .iter(|| async move { black_box(runner.run(phase).await.expect("phase")) });
        });
    }

    // Failure path: warn log, metrics and handler on every fourth cycle
    let runner = runner(FakeBehavior::failing(FailureMode::EveryNth(4)));
    let phase = RunPhase::sync("failing", CYCLES, Duration::ZERO);
    group.bench_function("sync_with_failures", |b| {
        b.iter(|| black_box(runner.run_blocking(&phase).expect("phase")));
    });

    group.finish();
}

fn width_benchmarks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("width");
    group.sample_size(20);
    group.throughput(Throughput::Elements(200));

    for width in [1, 4, 16, 64] {
        let behavior = FakeBehavior {
            connect_latency: Duration::from_micros(200),
            ..FakeBehavior::default()
        };
        let runner = runner(behavior).concurrency(width);
        let phase = RunPhase::concurrent("width", 200, Duration::ZERO);
        let (runner, phase) = (&runner, &phase);
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.to_async(&rt)
                .iter(|| async move { black_box(runner.run(phase).await.expect("phase")) });
        });
    }

    group.finish();
}

// ============================================================================
// Sampling and decoding
// ============================================================================

fn sample_benchmarks(c: &mut Criterion) {
    let sampler =
        MemorySampler::for_metric(MemoryMetric::ResidentSet, Duration::ZERO).expect("sampler");
    c.bench_function("memory_sample_rss", |b| {
        b.iter(|| black_box(sampler.sample("bench").expect("sample")));
    });
}

fn decode_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_reply");

    let single = BytesMut::from(&b"230 User logged in, proceed.\r\n"[..]);
    group.bench_function("single_line", |b| {
        b.iter(|| black_box(decode_reply(black_box(&single)).expect("reply")));
    });

    let mut banner = Vec::new();
    banner.extend_from_slice(b"220-Welcome\r\n");
    for i in 0..32 {
        banner.extend_from_slice(format!(" banner line {}\r\n", i).as_bytes());
    }
    banner.extend_from_slice(b"220 Ready\r\n");
    let multi = BytesMut::from(&banner[..]);
    group.bench_function("multi_line_banner", |b| {
        b.iter(|| black_box(decode_reply(black_box(&multi)).expect("reply")));
    });

    group.finish();
}

criterion_group!(
    benches,
    cycle_benchmarks,
    width_benchmarks,
    sample_benchmarks,
    decode_benchmarks
);
criterion_main!(benches);
