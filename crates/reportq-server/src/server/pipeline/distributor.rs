use crate::server::{
    broker::DeliveryStream, pipeline::pending::PendingDeliveries, pool::Outcome,
    store::ReportStatusStore, telemetry,
};
use reportq_core::{Error, JobRequest, JobResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counters reported by [`Distributor::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DistributorSummary {
    /// Jobs handed to the worker pool.
    pub forwarded: usize,
    /// Malformed bodies, dead-lettered.
    pub rejected: usize,
    /// Deliveries whose job id was already pending, dead-lettered.
    pub duplicates: usize,
}

/// Moves deliveries from the broker to the worker pool.
///
/// For each delivery: decode, track it in the pending table, record
/// `PENDING`, forward to the workers. Owns the only non-worker sender of the
/// result channel and the only sender of the job channel, so both close
/// when it returns.
pub struct Distributor {
    pub deliveries: DeliveryStream,
    pub pending: PendingDeliveries,
    pub statuses: ReportStatusStore,
    pub jobs: mpsc::Sender<JobRequest>,
    pub results: mpsc::Sender<Outcome>,
    pub shutdown: CancellationToken,
}

impl Distributor {
    pub async fn run(self) -> DistributorSummary {
        let Self {
            mut deliveries,
            pending,
            statuses,
            jobs,
            results,
            shutdown,
        } = self;
        let mut summary = DistributorSummary::default();

        loop {
            let delivery = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!("Distributor received shutdown signal");
                    break;
                }
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        tracing::info!("Delivery stream closed");
                        break;
                    }
                },
            };

            let request = match JobRequest::decode(delivery.body()) {
                Ok(request) => request,
                Err(e) => {
                    summary.rejected += 1;
                    telemetry::increment_rejected();
                    tracing::warn!(tag = %delivery.tag(), error = %e, "Rejecting malformed message");
                    if let Err(e) = delivery.nack(false).await {
                        tracing::error!(error = %e, "Failed to reject malformed message");
                    }
                    continue;
                }
            };
            let id = request.id.clone();

            if let Err((e, delivery)) = pending.insert(id.clone(), delivery).await {
                // A duplicate id is dead-lettered; anything else means the
                // table is gone and the message goes back to the broker.
                let duplicate = matches!(e, Error::DuplicateDelivery { .. });
                tracing::warn!(%id, error = %e, "Cannot track delivery, rejecting it");
                if let Some(delivery) = delivery {
                    if let Err(e) = delivery.nack(!duplicate).await {
                        tracing::error!(%id, error = %e, "Failed to reject delivery");
                    }
                }
                if duplicate {
                    summary.duplicates += 1;
                    continue;
                }
                break;
            }

            if let Err(e) = statuses.record(&JobResult::pending(&id)).await {
                tracing::warn!(%id, error = %e, "Failed to record PENDING");
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!(%id, "Distributor cancelled while forwarding");
                    break;
                }
                sent = jobs.send(request) => {
                    if sent.is_err() {
                        tracing::error!(%id, "Worker input channel closed");
                        break;
                    }
                }
            }
            summary.forwarded += 1;
            tracing::debug!(%id, "Forwarded job to workers");
        }

        drop(jobs);
        drop(results);
        tracing::info!(
            forwarded = summary.forwarded,
            rejected = summary.rejected,
            duplicates = summary.duplicates,
            "Distributor stopped"
        );
        summary
    }
}
