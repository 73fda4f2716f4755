use super::*;
use crate::server::{
    broker::memory::MemoryQueue,
    config::Backend,
    generator::SimulatedGenerator,
    pipeline::producer::sample_request,
    store::memory::MemoryStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use reportq_core::{
    JobResult, Status,
    types::{DATA_KEY_PREFIX, STATUS_KEY_PREFIX, data_key, status_key},
};
use std::collections::HashMap;
use tokio::time::{Instant, sleep, timeout};

fn config(num_workers: usize, task_timeout: Duration) -> PipelineConfig {
    PipelineConfig {
        backend: Backend::Memory,
        num_workers,
        task_timeout,
        num_requests: 0,
        publish_interval: Duration::from_millis(1),
        store_timeout: Duration::from_secs(1),
        status_ttl: Duration::from_secs(60),
        ..PipelineConfig::default()
    }
}

fn generator(delay: Duration, failure_rate: f64) -> Arc<SimulatedGenerator> {
    Arc::new(SimulatedGenerator::new(delay, delay, failure_rate))
}

async fn publish(queue: &MemoryQueue, ids: impl IntoIterator<Item = usize>) {
    for n in ids {
        let body = sample_request(n).encode().unwrap();
        queue.publish(Bytes::from(body)).await.unwrap();
    }
}

fn pipeline(
    config: PipelineConfig,
    queue: &MemoryQueue,
    store: Arc<dyn StatusStore>,
    generator: Arc<SimulatedGenerator>,
) -> Pipeline {
    Pipeline::new(config, Arc::new(queue.clone()), store, generator)
}

/// Every status written for `id`, oldest first.
fn history(store: &MemoryStore, id: &str) -> Vec<Status> {
    let key = status_key(id);
    store
        .journal()
        .into_iter()
        .filter(|(k, _)| *k == key)
        .map(|(_, v)| JobResult::decode(&v).unwrap().status)
        .collect()
}

/// Latest snapshot written to the data key of `id`.
fn report(store: &MemoryStore, id: &str) -> JobResult {
    let key = data_key(id);
    let raw = store
        .journal()
        .into_iter()
        .filter(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .next_back()
        .unwrap_or_else(|| panic!("no report for {id}"));
    JobResult::decode(&raw).unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn successful_job_is_completed_and_acked() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1]).await;
    queue.close();

    let summary = pipeline(
        config(3, Duration::from_secs(5)),
        &queue,
        store.clone(),
        generator(Duration::from_millis(10), 0.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(
        history(&store, "report-1"),
        [Status::Pending, Status::InProgress, Status::Completed]
    );
    let result = report(&store, "report-1");
    assert_eq!(result.status, Status::Completed);
    assert!(
        result
            .report_data
            .unwrap()
            .starts_with("Report report-1 - Type: sales, Generated On: ")
    );
    assert!(result.error.is_none());

    assert_eq!(queue.acked().len(), 1);
    assert!(queue.dead_letters().is_empty());
    assert_eq!(summary.settled.acked, 1);
    assert_eq!(summary.unsettled, 0);
    assert_eq!(summary.workers_stopped, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn generation_failure_is_dead_lettered() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1]).await;
    queue.close();

    let summary = pipeline(
        config(3, Duration::from_secs(5)),
        &queue,
        store.clone(),
        generator(Duration::from_millis(10), 1.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(
        history(&store, "report-1"),
        [Status::Pending, Status::InProgress, Status::Failed]
    );
    let result = report(&store, "report-1");
    assert_eq!(
        result.error.as_deref(),
        Some("simulated report generation error for ID report-1")
    );
    assert!(result.report_data.is_none());

    assert!(queue.acked().is_empty());
    assert_eq!(queue.dead_letters().len(), 1);
    assert_eq!(summary.settled.rejected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_expiry_fails_the_job() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1]).await;
    queue.close();

    let started = Instant::now();
    pipeline(
        config(3, Duration::from_millis(50)),
        &queue,
        store.clone(),
        generator(Duration::from_secs(30), 0.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let result = report(&store, "report-1");
    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.error.as_deref(), Some("deadline exceeded after 50ms"));
    assert_eq!(queue.dead_letters().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_fails_in_progress_jobs_and_leaves_the_rest_queued() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, 1..=5).await;

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        pipeline(
            config(2, Duration::from_secs(60)),
            &queue,
            store.clone(),
            generator(Duration::from_secs(30), 0.0),
        )
        .run(shutdown.clone()),
    );

    eventually(|| {
        history(&store, "report-1").contains(&Status::InProgress)
            && history(&store, "report-2").contains(&Status::InProgress)
    })
    .await;

    let cancelled_at = Instant::now();
    shutdown.cancel();
    let summary = timeout(Duration::from_secs(5), run)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));

    for id in ["report-1", "report-2"] {
        assert_eq!(
            history(&store, id),
            [Status::Pending, Status::InProgress, Status::Failed]
        );
        assert_eq!(report(&store, id).error.as_deref(), Some("context canceled"));
    }
    for id in ["report-3", "report-4", "report-5"] {
        assert!(history(&store, id).is_empty(), "{id} was touched");
    }

    // Nothing settled: the two in-flight deliveries go back on recovery.
    assert!(queue.acked().is_empty());
    assert!(queue.dead_letters().is_empty());
    assert_eq!(queue.ready_len(), 3);
    assert_eq!(summary.unsettled, 2);
    assert_eq!(summary.workers_stopped, 2);
    assert_eq!(queue.recover(), 2);
    assert_eq!(queue.ready_len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_messages_never_reach_the_store() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    queue.publish(Bytes::from_static(b"not json")).await.unwrap();
    queue
        .publish(Bytes::from_static(br#"{"id":"","report_type":"sales","created_at":"2024-01-01T00:00:00Z"}"#))
        .await
        .unwrap();
    publish(&queue, [1]).await;
    queue.close();

    let summary = pipeline(
        config(2, Duration::from_secs(5)),
        &queue,
        store.clone(),
        generator(Duration::from_millis(5), 0.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.distributed.rejected, 2);
    assert_eq!(summary.distributed.forwarded, 1);
    assert_eq!(queue.dead_letters().len(), 2);
    assert_eq!(queue.acked().len(), 1);
    assert!(
        store
            .journal()
            .iter()
            .all(|(key, _)| key.ends_with(":report-1")),
        "{:?}",
        store.journal()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_progress_jobs_never_exceed_the_pool_size() {
    const WORKERS: usize = 3;
    const JOBS: usize = 12;

    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, 1..=JOBS).await;
    queue.close();

    let summary = pipeline(
        config(WORKERS, Duration::from_secs(5)),
        &queue,
        store.clone(),
        Arc::new(SimulatedGenerator::new(
            Duration::from_millis(10),
            Duration::from_millis(30),
            0.0,
        )),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.settled.acked, JOBS);
    assert!(summary.peak_inflight <= WORKERS, "{summary:?}");

    // Replay the journal: at no point are more than WORKERS ids IN_PROGRESS.
    let mut latest: HashMap<String, Status> = HashMap::new();
    for (key, value) in store.journal() {
        if let Some(id) = key.strip_prefix(STATUS_KEY_PREFIX) {
            latest.insert(id.to_string(), JobResult::decode(&value).unwrap().status);
            let running = latest
                .values()
                .filter(|status| **status == Status::InProgress)
                .count();
            assert!(running <= WORKERS, "{running} jobs in progress");
        }
    }

    for n in 1..=JOBS {
        let id = format!("report-{n}");
        assert_eq!(
            history(&store, &id),
            [Status::Pending, Status::InProgress, Status::Completed],
            "{id}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_job_ids_are_dead_lettered() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1, 1]).await;
    queue.close();

    let summary = pipeline(
        config(2, Duration::from_secs(5)),
        &queue,
        store.clone(),
        generator(Duration::from_millis(100), 0.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.distributed.duplicates, 1);
    assert_eq!(queue.dead_letters().len(), 1);
    assert_eq!(queue.acked().len(), 1);
    assert_eq!(
        history(&store, "report-1"),
        [Status::Pending, Status::InProgress, Status::Completed]
    );
}

/// Fails the first `failures` writes to keys starting with `prefix`.
struct FlakyWrites {
    inner: Arc<MemoryStore>,
    prefix: &'static str,
    failures: AtomicUsize,
}

impl FlakyWrites {
    fn new(inner: Arc<MemoryStore>, prefix: &'static str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            prefix,
            failures: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl StatusStore for FlakyWrites {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if key.starts_with(self.prefix)
            && self
                .failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Store {
                context: "write refused".to_string(),
            });
        }
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unpersisted_report_is_left_for_redelivery() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1]).await;
    queue.close();

    let summary = pipeline(
        config(1, Duration::from_secs(5)),
        &queue,
        FlakyWrites::new(store.clone(), DATA_KEY_PREFIX, 1),
        generator(Duration::from_millis(5), 0.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.settled.held, 1);
    assert_eq!(summary.settled.acked, 0);
    assert_eq!(summary.unsettled, 0);
    // Run once; the status never leaves COMPLETED.
    assert_eq!(
        history(&store, "report-1"),
        [Status::Pending, Status::InProgress, Status::Completed]
    );
    assert!(queue.acked().is_empty());
    assert!(queue.dead_letters().is_empty());
    assert_eq!(queue.unacked_len(), 1);
    assert_eq!(queue.recover(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_job_is_not_retried_when_its_report_is_not_persisted() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1]).await;
    queue.close();

    let summary = pipeline(
        config(1, Duration::from_secs(5)),
        &queue,
        FlakyWrites::new(store.clone(), DATA_KEY_PREFIX, 1),
        generator(Duration::from_millis(5), 1.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(summary.settled.rejected, 1);
    assert_eq!(summary.settled.held, 0);
    assert_eq!(
        history(&store, "report-1"),
        [Status::Pending, Status::InProgress, Status::Failed]
    );
    assert_eq!(queue.dead_letters().len(), 1);
    assert_eq!(queue.unacked_len(), 0);
    assert_eq!(queue.ready_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_write_errors_do_not_stop_the_job() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    publish(&queue, [1]).await;
    queue.close();

    // PENDING and IN_PROGRESS are refused, COMPLETED goes through.
    let summary = pipeline(
        config(1, Duration::from_secs(5)),
        &queue,
        FlakyWrites::new(store.clone(), STATUS_KEY_PREFIX, 2),
        generator(Duration::from_millis(5), 0.0),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(history(&store, "report-1"), [Status::Completed]);
    assert_eq!(report(&store, "report-1").status, Status::Completed);
    assert_eq!(summary.settled.acked, 1);
    assert_eq!(queue.acked().len(), 1);
    assert_eq!(queue.unacked_len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn producer_feeds_the_pipeline() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();

    let mut config = config(2, Duration::from_secs(5));
    config.num_requests = 4;
    let run = tokio::spawn(
        pipeline(
            config,
            &queue,
            store.clone(),
            generator(Duration::from_millis(5), 0.0),
        )
        .run(shutdown.clone()),
    );

    eventually(|| queue.acked().len() == 4).await;
    shutdown.cancel();
    let summary = run.await.unwrap().unwrap();

    assert_eq!(
        summary.produced,
        Some(ProducerSummary {
            published: 4,
            skipped: 0
        })
    );
    assert_eq!(summary.settled.acked, 4);
    assert_eq!(report(&store, "report-4").status, Status::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_every_stage_promptly() {
    let queue = MemoryQueue::new();
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();

    let mut config = config(3, Duration::from_secs(60));
    config.num_requests = 100;
    config.publish_interval = Duration::from_millis(20);
    let run = tokio::spawn(
        pipeline(
            config,
            &queue,
            store.clone(),
            generator(Duration::from_secs(30), 0.0),
        )
        .run(shutdown.clone()),
    );

    sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let summary = timeout(Duration::from_secs(5), run)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();

    assert!(summary.produced.is_none());
    assert_eq!(summary.workers_stopped, 3);
    assert!(summary.peak_inflight <= 3);
}
