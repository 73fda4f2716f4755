use clap::Parser;
use reportq_server::server::{
    broker::{MessageQueue, memory::MemoryQueue, redis_streams::RedisStreamsQueue},
    config::{Backend, CliArgs, PipelineConfig},
    generator::SimulatedGenerator,
    pipeline::Pipeline,
    store::{StatusStore, memory::MemoryStore, redis::RedisStore},
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = PipelineConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    // Connection failures at startup are fatal.
    let (queue, store) = connect(&config).await?;
    let generator = Arc::new(SimulatedGenerator::from_config(&config));

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = Pipeline::new(config, queue, store, generator)
        .run(shutdown)
        .await;
    signals.abort();

    match &result {
        Ok(summary) => tracing::info!(
            acked = summary.settled.acked,
            rejected = summary.settled.rejected,
            held = summary.settled.held,
            unsettled = summary.unsettled,
            "Service shut down successfully"
        ),
        Err(e) => tracing::error!("Pipeline failed: {e}"),
    }

    providers.shutdown();
    result?;
    Ok(())
}

async fn connect(
    config: &PipelineConfig,
) -> anyhow::Result<(Arc<dyn MessageQueue>, Arc<dyn StatusStore>)> {
    match config.backend {
        Backend::Redis => {
            let queue = RedisStreamsQueue::connect(&config.redis_url, &config.queue_name)
                .await?
                .with_consumer(&config.consumer_name);
            let store = RedisStore::connect(&config.redis_url).await?;
            Ok((Arc::new(queue), Arc::new(store)))
        }
        Backend::Memory => Ok((Arc::new(MemoryQueue::new()), Arc::new(MemoryStore::new()))),
    }
}

fn log_startup_info(config: &PipelineConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting report pipeline on queue {} with full config: {:#?}",
            config.queue_name,
            config
        );
    } else {
        tracing::info!(
            "Starting report pipeline on queue {} with {} workers ({:?} backend)",
            config.queue_name,
            config.num_workers,
            config.backend
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    shutdown.cancel();
}
