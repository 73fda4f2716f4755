use bytes::Bytes;
use core::time::Duration;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use reportq_server::server::{
    broker::{MessageQueue, memory::MemoryQueue},
    config::{Backend, PipelineConfig},
    generator::SimulatedGenerator,
    pipeline::{Pipeline, producer::sample_request},
    store::memory::MemoryStore,
};
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

// Jobs pushed through the pipeline per iteration.
const TOTAL_JOBS: usize = 256;

async fn drain_pipeline(num_workers: usize) {
    let queue = MemoryQueue::new();
    for n in 1..=TOTAL_JOBS {
        let body = sample_request(n).encode().unwrap();
        queue.publish(Bytes::from(body)).await.unwrap();
    }
    queue.close();

    let config = PipelineConfig {
        backend: Backend::Memory,
        num_workers,
        num_requests: 0,
        ..PipelineConfig::default()
    };
    let generator = SimulatedGenerator::new(Duration::ZERO, Duration::ZERO, 0.0);
    let summary = Pipeline::new(
        config,
        Arc::new(queue),
        Arc::new(MemoryStore::new()),
        Arc::new(generator),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();
    assert_eq!(summary.settled.acked, TOTAL_JOBS);
}

/// End-to-end throughput of the in-memory pipeline: decode, status writes,
/// generation, ack.
fn bench_pipeline(c: &mut Criterion) {
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let mut group = c.benchmark_group("pipeline/memory");
    group.throughput(Throughput::Elements(TOTAL_JOBS as u64));

    for num_workers in [1, 4, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("workers", num_workers),
            &num_workers,
            |b, &num_workers| {
                b.to_async(&rt).iter(|| drain_pipeline(num_workers));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
