use crate::server::{broker::MessageQueue, telemetry};
use bytes::Bytes;
use core::time::Duration;
use reportq_core::{Error, JobRequest, Result, types::REPORT_TYPES};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSummary {
    pub published: usize,
    /// Requests that could not be encoded or published.
    pub skipped: usize,
}

/// Builds the `n`-th (1-based) sample request: id `report-<n>`, report types
/// cycling through [`REPORT_TYPES`], fixed January 2024 PDF parameters.
pub fn sample_request(n: usize) -> JobRequest {
    let parameters = BTreeMap::from([
        ("start_date".to_string(), "2024-01-01".to_string()),
        ("end_date".to_string(), "2024-01-31".to_string()),
        ("format".to_string(), "PDF".to_string()),
    ]);
    JobRequest::new(
        format!("report-{n}"),
        REPORT_TYPES[(n - 1) % REPORT_TYPES.len()],
        parameters,
    )
}

/// Publishes sample report requests at a fixed cadence.
pub struct Producer {
    queue: Arc<dyn MessageQueue>,
}

impl Producer {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Publishes `count` requests, waiting `interval` between two publishes.
    /// Failed publishes are logged and skipped without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires.
    pub async fn produce(
        &self,
        cancel: &CancellationToken,
        count: usize,
        interval: Duration,
    ) -> Result<ProducerSummary> {
        let mut summary = ProducerSummary::default();

        for n in 1..=count {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let request = sample_request(n);
            let body = match request.encode() {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    summary.skipped += 1;
                    tracing::warn!(id = %request.id, error = %e, "Failed to encode request");
                    continue;
                }
            };

            let published = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                published = self.queue.publish(body) => published,
            };
            if let Err(e) = published {
                summary.skipped += 1;
                tracing::warn!(id = %request.id, error = %e, "Failed to publish request");
                continue;
            }
            summary.published += 1;
            telemetry::increment_published();
            tracing::info!(id = %request.id, report_type = %request.report_type, "Published report request");

            if n < count {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }

        tracing::info!(
            published = summary.published,
            skipped = summary.skipped,
            "Producer finished"
        );
        Ok(summary)
    }
}
