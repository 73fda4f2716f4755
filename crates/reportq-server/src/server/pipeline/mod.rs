//! Pipeline wiring and lifecycle.
//!
//! ```text
//!  Producer ──publish──▶ MessageQueue ──deliveries──▶ Distributor
//!                                                       │  │
//!                               PendingDeliveries ◀─────┘  │ jobs (cap N)
//!                                     ▲                    ▼
//!                                     │              WorkerPool (N)
//!                                     │                    │ outcomes (cap 2N)
//!                                     └──── take ───── Ack handler
//! ```
//!
//! Everything observes one root [`CancellationToken`]. Cancelling it stops
//! every stage; closing the queue instead drains in-flight jobs and lets each
//! stage exit once its input channel closes.

pub mod acker;
pub mod distributor;
pub mod pending;
pub mod producer;

#[cfg(test)]
mod tests;

use crate::server::{
    broker::MessageQueue,
    config::PipelineConfig,
    generator::ReportGenerator,
    pool::WorkerPool,
    store::{ReportStatusStore, StatusStore},
};
use acker::AckSummary;
use distributor::{Distributor, DistributorSummary};
use pending::PendingDeliveries;
use producer::{Producer, ProducerSummary};
use reportq_core::{Error, Result};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Final counters of one [`Pipeline::run`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineSummary {
    /// `None` when production was cancelled.
    pub produced: Option<ProducerSummary>,
    pub distributed: DistributorSummary,
    pub settled: AckSummary,
    /// Most jobs ever in progress at once.
    pub peak_inflight: usize,
    /// Workers that exited before their grace period ran out.
    pub workers_stopped: usize,
    /// Deliveries left unsettled at exit, to be redelivered by the broker.
    pub unsettled: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn StatusStore>,
    generator: Arc<dyn ReportGenerator>,
}

async fn joined<T: Default>(stage: &str, handle: JoinHandle<T>) -> T {
    handle.await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "{stage} task failed");
        T::default()
    })
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn StatusStore>,
        generator: Arc<dyn ReportGenerator>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            generator,
        }
    }

    /// Runs producer, distributor, workers and ack handler until `shutdown`
    /// fires or the delivery stream ends, then waits for every stage.
    ///
    /// # Errors
    ///
    /// Fails only if the consumer cannot be registered with the broker.
    pub async fn run(self, shutdown: CancellationToken) -> Result<PipelineSummary> {
        let Self {
            config,
            queue,
            store,
            generator,
        } = self;

        let statuses = ReportStatusStore::new(store, config.status_ttl, config.store_timeout);
        let deliveries = queue.consume(config.prefetch(), shutdown.clone()).await?;

        let (pending, pending_owner) = PendingDeliveries::spawn(config.prefetch());
        let (job_tx, job_rx) = mpsc::channel(config.prefetch());
        let (result_tx, result_rx) = mpsc::channel(config.result_buffer_size());

        let pool = WorkerPool::spawn(
            config.num_workers,
            job_rx,
            result_tx.clone(),
            statuses.clone(),
            generator,
            config.task_timeout,
            shutdown.clone(),
        );
        let inflight = Arc::clone(pool.inflight());

        let acker = tokio::spawn(acker::run(result_rx, pending.clone(), shutdown.clone()));

        let distributor = tokio::spawn(
            Distributor {
                deliveries,
                pending,
                statuses,
                jobs: job_tx,
                results: result_tx,
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        let producer = {
            let producer = Producer::new(queue);
            let shutdown = shutdown.clone();
            let (count, interval) = (config.num_requests, config.publish_interval);
            tokio::spawn(async move { producer.produce(&shutdown, count, interval).await })
        };

        tracing::info!(
            workers = config.num_workers,
            prefetch = config.prefetch(),
            task_timeout = ?config.task_timeout,
            "Pipeline started"
        );

        let produced = match producer.await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(Error::Cancelled)) => {
                tracing::info!("Producer cancelled");
                None
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Producer failed");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Producer task failed");
                None
            }
        };

        let distributed = joined("Distributor", distributor).await;

        // Upper bound for a cancelled worker: abandon generation, write the
        // terminal snapshot, hand off the result.
        let grace = config.task_timeout + config.store_timeout * 2;
        let workers_stopped = pool.join(grace).await;
        let settled = joined("Ack handler", acker).await;
        let unsettled = joined("Pending table", pending_owner).await;

        let summary = PipelineSummary {
            produced,
            distributed,
            settled,
            peak_inflight: inflight.peak(),
            workers_stopped,
            unsettled,
        };
        tracing::info!(?summary, "Pipeline stopped");
        Ok(summary)
    }
}
