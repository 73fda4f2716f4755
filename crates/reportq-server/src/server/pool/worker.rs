use crate::server::{
    generator::ReportGenerator, pool::manager::InflightGauge, store::ReportStatusStore, telemetry,
};
use core::time::Duration;
use reportq_core::{Error, JobRequest, JobResult, Status};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

/// What a worker hands to the acknowledgment handler for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub result: JobResult,
    /// Whether the terminal snapshot reached the status store.
    pub persisted: bool,
}

/// Everything a worker needs, shared by every worker of the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub jobs: Arc<Mutex<mpsc::Receiver<JobRequest>>>,
    pub results: mpsc::Sender<Outcome>,
    pub statuses: ReportStatusStore,
    pub generator: Arc<dyn ReportGenerator>,
    pub task_timeout: Duration,
    pub shutdown: CancellationToken,
    pub inflight: Arc<InflightGauge>,
}

/// Worker task: pulls jobs off the shared input channel until the channel
/// closes or the root token is cancelled.
///
/// Every job goes through the same steps:
///
/// 1. Record `IN_PROGRESS` (best effort).
/// 2. Run the generator under a child token bounded by the task deadline.
/// 3. Record the terminal snapshot.
/// 4. Hand the [`Outcome`] to the acknowledgment handler.
///
/// Each step is observed by the root token, so a cancelled worker stops
/// within one task deadline plus one store timeout.
pub async fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    tracing::trace!("Worker {worker_id} started");

    loop {
        let job = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => {
                tracing::debug!("Worker {worker_id} received shutdown signal");
                break;
            }
            job = async { ctx.jobs.lock().await.recv().await } => job,
        };

        let Some(job) = job else {
            tracing::debug!("Worker {worker_id} input channel closed");
            break;
        };

        let outcome = process_job(worker_id, job, &ctx).await;
        let id = outcome.result.request_id.clone();

        tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => {
                tracing::warn!(
                    %id,
                    "Worker {worker_id} cancelled before handing off its result"
                );
                break;
            }
            sent = ctx.results.send(outcome) => {
                if sent.is_err() {
                    tracing::error!("Worker {worker_id} result channel closed");
                    break;
                }
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

/// Runs one job to a terminal snapshot.
pub(crate) async fn process_job(
    worker_id: usize,
    job: JobRequest,
    ctx: &WorkerContext,
) -> Outcome {
    let _inflight = ctx.inflight.enter();
    let started = Instant::now();
    tracing::info!(id = %job.id, report_type = %job.report_type, "Worker {worker_id} processing job");

    let mut result = JobResult::pending(&job.id);
    if let Err(e) = result.advance(Status::InProgress) {
        tracing::error!(id = %job.id, error = %e, "Worker {worker_id} could not start job");
    }
    if let Err(e) = ctx.statuses.record(&result).await {
        tracing::warn!(id = %job.id, error = %e, "Worker {worker_id} failed to record IN_PROGRESS");
    }

    let task_token = ctx.shutdown.child_token();
    let generated = match timeout(
        ctx.task_timeout,
        ctx.generator.generate(&job, &task_token),
    )
    .await
    {
        Ok(generated) => generated,
        Err(_) => {
            task_token.cancel();
            Err(Error::DeadlineExceeded(ctx.task_timeout))
        }
    };

    let finished = match generated {
        Ok(report_data) => {
            telemetry::increment_completed();
            tracing::info!(id = %job.id, "Worker {worker_id} completed job");
            result.complete(report_data)
        }
        Err(e) => {
            telemetry::increment_failed();
            tracing::warn!(id = %job.id, error = %e, "Worker {worker_id} failed job");
            result.fail(e.to_string())
        }
    };
    if let Err(e) = finished {
        tracing::error!(id = %job.id, error = %e, "Worker {worker_id} could not finish job");
    }

    let persisted = match ctx.statuses.record(&result).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                id = %job.id,
                status = %result.status,
                error = %e,
                "Worker {worker_id} failed to record terminal status"
            );
            false
        }
    };

    telemetry::record_job_duration(started.elapsed().as_secs_f64() * 1_000.0);
    Outcome { result, persisted }
}
