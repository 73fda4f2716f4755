//! Fixed-size pool of report workers.
//!
//! [`WorkerPool`] spawns `N` [`worker_loop`] tasks that compete for jobs on a
//! single shared input channel. There is no per-worker queue and no
//! round-robin: whichever worker is idle takes the next job, which is what
//! keeps the number of in-progress jobs bounded by `N`.
//!
//! The pool does not own shutdown. Workers stop when their input channel
//! closes (graceful drain) or when the root [`CancellationToken`] fires;
//! [`WorkerPool::join`] only waits for them.

use crate::server::{
    generator::ReportGenerator,
    pool::worker::{Outcome, WorkerContext, worker_loop},
    store::ReportStatusStore,
    telemetry,
};
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use reportq_core::JobRequest;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Number of jobs currently between `IN_PROGRESS` and their terminal write,
/// plus the highest value seen.
#[derive(Debug, Default)]
pub struct InflightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InflightGauge {
    pub fn enter(&self) -> InflightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        telemetry::increment_inflight();
        InflightGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

pub struct InflightGuard<'a> {
    gauge: &'a InflightGauge,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::AcqRel);
        telemetry::decrement_inflight();
    }
}

/// Handles to the spawned workers.
pub struct WorkerPool {
    handles: Vec<(usize, JoinHandle<()>)>,
    inflight: Arc<InflightGauge>,
}

impl WorkerPool {
    /// Spawns `num_workers` workers sharing `jobs`.
    ///
    /// `results` is moved in and cloned once per worker, so the result
    /// channel closes as soon as the last worker exits.
    pub fn spawn(
        num_workers: usize,
        jobs: mpsc::Receiver<JobRequest>,
        results: mpsc::Sender<Outcome>,
        statuses: ReportStatusStore,
        generator: Arc<dyn ReportGenerator>,
        task_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let inflight = Arc::new(InflightGauge::default());
        let ctx = WorkerContext {
            jobs: Arc::new(Mutex::new(jobs)),
            results,
            statuses,
            generator,
            task_timeout,
            shutdown,
            inflight: Arc::clone(&inflight),
        };

        let handles = (0..num_workers)
            .map(|worker_id| (worker_id, tokio::spawn(worker_loop(worker_id, ctx.clone()))))
            .collect();

        tracing::info!("Started {num_workers} workers");
        Self { handles, inflight }
    }

    pub fn inflight(&self) -> &Arc<InflightGauge> {
        &self.inflight
    }

    /// Waits up to `grace` per worker for every worker to exit. Workers that
    /// do not stop in time are aborted.
    ///
    /// Returns how many workers exited on their own.
    pub async fn join(self, grace: Duration) -> usize {
        tracing::debug!("Waiting for up to {grace:?} per worker to stop");

        let waits = self.handles.into_iter().map(|(worker_id, mut handle)| async move {
            match timeout(grace, &mut handle).await {
                Ok(Ok(())) => {
                    tracing::trace!("Worker {worker_id} shutdown acknowledged");
                    true
                }
                Ok(Err(e)) => {
                    tracing::error!("Worker {worker_id} returned error: {e}");
                    false
                }
                Err(_) => {
                    tracing::warn!("Worker {worker_id} shutdown timed out, aborting");
                    handle.abort();
                    false
                }
            }
        });

        let stopped = futures::future::join_all(waits)
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count();

        tracing::info!("Worker pool shutdown complete");
        stopped
    }
}
