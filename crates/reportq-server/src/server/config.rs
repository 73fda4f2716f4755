use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::time::Duration;
use reportq_core::types::DEFAULT_STATUS_TTL;

/// Which implementation backs the message queue and the status store.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Redis Streams for the queue, plain Redis keys for the status store.
    Redis,
    /// Everything in-process. Nothing survives a restart.
    Memory,
}

/// Runtime configuration for the `reportq-server` binary.
///
/// These settings control the size of the worker pool, the per-task deadline,
/// the producer cadence and where jobs and statuses live. All values are
/// parsed from CLI arguments or environment variables, with defaults that
/// match the reference deployment (3 workers, 5s deadline, 10 requests every
/// 500ms).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "reportq-server",
    version,
    about = "Produces report jobs onto a durable queue and processes them with a bounded worker pool"
)]
pub struct CliArgs {
    /// Name of the durable queue (Redis stream key for the `redis` backend).
    ///
    /// Environment variable: `QUEUE_NAME`
    #[arg(long, env = "QUEUE_NAME", default_value_t = String::from("report_requests"))]
    pub queue_name: String,

    /// Redis connection URL used by both the queue and the status store.
    ///
    /// Environment variable: `REDIS_URL`
    #[arg(long, env = "REDIS_URL", default_value_t = String::from("redis://127.0.0.1:6379"))]
    pub redis_url: String,

    /// Consumer name within the queue's consumer group. Unacknowledged
    /// entries are redelivered to the consumer with the same name after a
    /// restart, so keep it stable per instance.
    ///
    /// Environment variable: `CONSUMER_NAME`
    #[arg(long, env = "CONSUMER_NAME", default_value_t = String::from("reportq-server"))]
    pub consumer_name: String,

    /// Backend for the queue and the status store.
    ///
    /// Environment variable: `BACKEND`
    #[arg(long, env = "BACKEND", value_enum, default_value_t = Backend::Redis)]
    pub backend: Backend,

    /// Number of concurrent workers. Also used as the broker prefetch limit
    /// and the capacity of the worker input channel, so at most this many
    /// jobs are in flight between the queue and the workers.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 3)]
    pub num_workers: usize,

    /// Deadline for a single report generation, in milliseconds.
    ///
    /// Environment variable: `TASK_TIMEOUT_MS`
    #[arg(long, env = "TASK_TIMEOUT_MS", default_value_t = 5_000)]
    pub task_timeout_ms: u64,

    /// Delay between two producer publishes, in milliseconds.
    ///
    /// Environment variable: `PUBLISH_INTERVAL_MS`
    #[arg(long, env = "PUBLISH_INTERVAL_MS", default_value_t = 500)]
    pub publish_interval_ms: u64,

    /// Number of report requests the producer publishes before stopping.
    ///
    /// Environment variable: `NUM_REQUESTS`
    #[arg(long, env = "NUM_REQUESTS", default_value_t = 10)]
    pub num_requests: usize,

    /// Expiry of the `report:status:*` and `report:data:*` keys, in seconds.
    ///
    /// Environment variable: `STATUS_TTL_SECS`
    #[arg(long, env = "STATUS_TTL_SECS", default_value_t = DEFAULT_STATUS_TTL.as_secs())]
    pub status_ttl_secs: u64,

    /// Upper bound on a single status store call, in milliseconds.
    ///
    /// Environment variable: `STORE_TIMEOUT_MS`
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 2_000)]
    pub store_timeout_ms: u64,

    /// Probability in `[0, 1]` that a simulated generation fails.
    ///
    /// Environment variable: `FAILURE_RATE`
    #[arg(long, env = "FAILURE_RATE", default_value_t = 0.2)]
    pub failure_rate: f64,

    /// Lower bound of the simulated generation latency, in milliseconds.
    ///
    /// Environment variable: `MIN_DELAY_MS`
    #[arg(long, env = "MIN_DELAY_MS", default_value_t = 1_000)]
    pub min_delay_ms: u64,

    /// Upper bound of the simulated generation latency, in milliseconds.
    ///
    /// Environment variable: `MAX_DELAY_MS`
    #[arg(long, env = "MAX_DELAY_MS", default_value_t = 5_000)]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_name: String,
    pub redis_url: String,
    pub consumer_name: String,
    pub backend: Backend,
    pub num_workers: usize,
    pub task_timeout: Duration,
    pub publish_interval: Duration,
    pub num_requests: usize,
    pub status_ttl: Duration,
    pub store_timeout: Duration,
    pub failure_rate: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl PipelineConfig {
    /// Broker prefetch (QoS) limit. Equal to the pool size.
    pub const fn prefetch(&self) -> usize {
        self.num_workers
    }

    /// Capacity of the channel between workers and the acknowledgment
    /// handler.
    pub const fn result_buffer_size(&self) -> usize {
        self.num_workers * 2
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_name: "report_requests".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            consumer_name: "reportq-server".to_string(),
            backend: Backend::Redis,
            num_workers: 3,
            task_timeout: Duration::from_secs(5),
            publish_interval: Duration::from_millis(500),
            num_requests: 10,
            status_ttl: DEFAULT_STATUS_TTL,
            store_timeout: Duration::from_secs(2),
            failure_rate: 0.2,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl TryFrom<CliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.queue_name.is_empty() {
            bail!("QUEUE_NAME must not be empty");
        }

        if args.consumer_name.is_empty() {
            bail!("CONSUMER_NAME must not be empty");
        }

        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.task_timeout_ms == 0 {
            bail!("TASK_TIMEOUT_MS must be greater than 0");
        }

        if args.store_timeout_ms == 0 {
            bail!("STORE_TIMEOUT_MS must be greater than 0");
        }

        if args.status_ttl_secs == 0 {
            bail!("STATUS_TTL_SECS must be greater than 0");
        }

        if !(0.0..=1.0).contains(&args.failure_rate) {
            bail!(
                "FAILURE_RATE ({}) must be within [0, 1]",
                args.failure_rate
            );
        }

        if args.min_delay_ms > args.max_delay_ms {
            bail!(
                "MIN_DELAY_MS ({}) exceeds MAX_DELAY_MS ({})",
                args.min_delay_ms,
                args.max_delay_ms
            );
        }

        Ok(Self {
            queue_name: args.queue_name,
            redis_url: args.redis_url,
            consumer_name: args.consumer_name,
            backend: args.backend,
            num_workers: args.num_workers,
            task_timeout: Duration::from_millis(args.task_timeout_ms),
            publish_interval: Duration::from_millis(args.publish_interval_ms),
            num_requests: args.num_requests,
            status_ttl: Duration::from_secs(args.status_ttl_secs),
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            failure_rate: args.failure_rate,
            min_delay: Duration::from_millis(args.min_delay_ms),
            max_delay: Duration::from_millis(args.max_delay_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<PipelineConfig> {
        let argv = core::iter::once("reportq-server").chain(extra.iter().copied());
        PipelineConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = parse(&["--backend", "memory"]).unwrap();

        assert_eq!(config.queue_name, "report_requests");
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.prefetch(), 3);
        assert_eq!(config.result_buffer_size(), 6);
        assert_eq!(config.task_timeout, Duration::from_secs(5));
        assert_eq!(config.publish_interval, Duration::from_millis(500));
        assert_eq!(config.num_requests, 10);
        assert_eq!(config.status_ttl, Duration::from_secs(86_400));
        assert_eq!(config.backend, Backend::Memory);
    }

    #[test]
    fn rejects_an_empty_pool() {
        let err = parse(&["--num-workers", "0"]).unwrap_err();
        assert!(err.to_string().contains("NUM_WORKERS"));
    }

    #[test]
    fn rejects_out_of_range_failure_rate() {
        assert!(parse(&["--failure-rate", "1.5"]).is_err());
        assert!(parse(&["--failure-rate", "-0.1"]).is_err());
        assert!(parse(&["--failure-rate", "1"]).is_ok());
    }

    #[test]
    fn rejects_inverted_delay_range() {
        let err = parse(&["--min-delay-ms", "900", "--max-delay-ms", "100"]).unwrap_err();
        assert!(err.to_string().contains("MIN_DELAY_MS"));
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(parse(&["--task-timeout-ms", "0"]).is_err());
        assert!(parse(&["--store-timeout-ms", "0"]).is_err());
        assert!(parse(&["--status-ttl-secs", "0"]).is_err());
    }
}
