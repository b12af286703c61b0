use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ingest_core::bootstrap::connect_pipeline;
use ingest_core::config::load_config;
use ingest_core::ingestor::{Ingestor, LoopSettings};
use ingest_core::source::sqs::SqsQueue;
use ingest_core::telemetry::init_tracing;

/// Optional path to a YAML config file. Without it the worker is configured
/// from the environment.
const CONFIG_PATH_ENV: &str = "INGEST_CONFIG_PATH";

/// This is the entry point for running the ingestion worker on container
/// hosting services like AWS ECS, EKS, or a scheduled task.
///
/// What it does at a high-level:
///     Load and validate config.
///     Connect to the warehouse (fatal if unreachable).
///     Poll the notification queue, one message at a time:
///         - fetch the referenced object and decode its records
///         - insert them into the warehouse
///         - delete the message, or leave it for redelivery
///     Stop when the queue is drained or, in long-poll mode, on SIGINT/SIGTERM.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var(CONFIG_PATH_ENV).ok();
    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(queue_url = %config.queue.url, table = %config.warehouse.table, "Configuration loaded");

    let (sqs, pipeline) = connect_pipeline(&config).await?;
    let queue = Arc::new(SqsQueue::new(sqs, config.queue.url.clone()));
    let mut ingestor = Ingestor::new(queue, pipeline, LoopSettings::from_config(&config));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match ingestor.run(&shutdown).await {
        Ok(metrics) => {
            info!(?metrics, "Ingestion finished");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, metrics = ?ingestor.get_metrics(), "Ingestion aborted");
            Err(e).context("Ingestion loop failed")
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop the worker");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested, finishing the current message");
    shutdown.cancel();
}
