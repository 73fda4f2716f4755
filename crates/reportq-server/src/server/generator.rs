use crate::server::config::PipelineConfig;
use async_trait::async_trait;
use core::time::Duration;
use rand::Rng;
use reportq_core::{Error, JobRequest, Result};
use tokio_util::sync::CancellationToken;

/// Produces the report payload for one request.
///
/// Implementations must return promptly with [`Error::Cancelled`] once
/// `cancel` fires. The caller enforces the per-task deadline on top.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, request: &JobRequest, cancel: &CancellationToken) -> Result<String>;
}

/// Stand-in generator: sleeps for a random duration and fails with a fixed
/// probability.
#[derive(Debug, Clone)]
pub struct SimulatedGenerator {
    min_delay: Duration,
    max_delay: Duration,
    failure_rate: f64,
}

impl SimulatedGenerator {
    /// `failure_rate` is clamped to `[0, 1]`; NaN means never fail.
    pub fn new(min_delay: Duration, max_delay: Duration, failure_rate: f64) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            0.0
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self {
            min_delay: min_delay.min(max_delay),
            max_delay,
            failure_rate,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.min_delay, config.max_delay, config.failure_rate)
    }
}

impl Default for SimulatedGenerator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5), 0.2)
    }
}

#[async_trait]
impl ReportGenerator for SimulatedGenerator {
    async fn generate(&self, request: &JobRequest, cancel: &CancellationToken) -> Result<String> {
        // ThreadRng is not Send; draw everything before the first await.
        let (delay, fails, value) = {
            let mut rng = rand::rng();
            let min = self.min_delay.as_millis() as u64;
            let max = self.max_delay.as_millis() as u64;
            (
                Duration::from_millis(rng.random_range(min..=max)),
                rng.random_bool(self.failure_rate),
                rng.random_range(0..1000u32),
            )
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }

        if fails {
            return Err(Error::Generation {
                reason: format!("simulated report generation error for ID {}", request.id),
            });
        }

        Ok(format!(
            "Report {} - Type: {}, Generated On: {}, Data: Random Value {}",
            request.id,
            request.report_type,
            chrono::Utc::now().to_rfc3339(),
            value
        ))
    }
}
