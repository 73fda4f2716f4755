use crate::server::{pipeline::pending::PendingDeliveries, pool::Outcome};
use reportq_core::Status;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counters reported by [`run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckSummary {
    pub acked: usize,
    /// Failed jobs, rejected without requeue.
    pub rejected: usize,
    /// Completed jobs whose snapshot was not persisted. Their deliveries are
    /// left unsettled for the broker to redeliver after a restart.
    pub held: usize,
    /// Results with no matching delivery.
    pub orphaned: usize,
    /// Ack or nack calls the broker refused.
    pub settle_errors: usize,
}

/// What to do with the delivery behind a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Reject,
    /// Neither ack nor nack. The broker still owns the message.
    Hold,
}

fn settlement(outcome: &Outcome) -> Settlement {
    match (outcome.result.status, outcome.persisted) {
        (Status::Completed, true) => Settlement::Ack,
        // The report is not durable but the status key may already be terminal.
        (Status::Completed, false) => Settlement::Hold,
        (Status::Failed | Status::Pending | Status::InProgress, _) => Settlement::Reject,
    }
}

/// Acknowledgment handler: settles one delivery per worker outcome until the
/// result channel closes or the root token is cancelled.
///
/// | status      | persisted | broker action          |
/// |-------------|-----------|------------------------|
/// | `COMPLETED` | yes       | ack                    |
/// | `COMPLETED` | no        | left unsettled         |
/// | `FAILED`    | -         | nack, no requeue       |
/// | other       | -         | nack, no requeue (bug) |
pub async fn run(
    mut results: mpsc::Receiver<Outcome>,
    pending: PendingDeliveries,
    shutdown: CancellationToken,
) -> AckSummary {
    let mut summary = AckSummary::default();

    loop {
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::info!("Ack handler received shutdown signal");
                break;
            }
            outcome = results.recv() => match outcome {
                Some(outcome) => outcome,
                None => {
                    tracing::info!("Result channel closed");
                    break;
                }
            },
        };
        let id = outcome.result.request_id.as_str();

        let delivery = match pending.take(id).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                summary.orphaned += 1;
                tracing::warn!(%id, "No pending delivery for result");
                continue;
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "Pending table unavailable");
                break;
            }
        };

        let action = settlement(&outcome);
        if !outcome.result.is_terminal() {
            tracing::error!(
                %id,
                status = %outcome.result.status,
                "Received non-terminal result, rejecting delivery"
            );
        }

        let settled = match action {
            Settlement::Ack => delivery.ack().await,
            Settlement::Reject => delivery.nack(false).await,
            Settlement::Hold => {
                tracing::warn!(%id, "Report not persisted, leaving delivery unsettled");
                drop(delivery);
                Ok(())
            }
        };
        match settled {
            Ok(()) => {
                match action {
                    Settlement::Ack => summary.acked += 1,
                    Settlement::Reject => summary.rejected += 1,
                    Settlement::Hold => summary.held += 1,
                }
                tracing::debug!(%id, ?action, "Settled delivery");
            }
            Err(e) => {
                summary.settle_errors += 1;
                tracing::error!(%id, ?action, error = %e, "Failed to settle delivery");
            }
        }
    }

    tracing::info!(
        acked = summary.acked,
        rejected = summary.rejected,
        held = summary.held,
        orphaned = summary.orphaned,
        "Ack handler stopped"
    );
    summary
}
