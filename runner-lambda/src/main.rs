mod batch;

use aws_lambda_events::event::sqs::{SqsBatchResponse, SqsEvent};
use lambda_runtime::{Error, LambdaEvent, service_fn};
use tracing::info;

use ingest_core::bootstrap::connect_pipeline;
use ingest_core::config::WorkerConfig;
use ingest_core::ingestor::Pipeline;
use ingest_core::telemetry::init_tracing;

use crate::batch::process_batch;

pub async fn lambda_handler(
    event: LambdaEvent<SqsEvent>,
    pipeline: Pipeline,
) -> Result<SqsBatchResponse, Error> {
    info!(
        request_id = %event.context.request_id,
        records = event.payload.records.len(),
        "Received SQS batch"
    );
    Ok(process_batch(event.payload, pipeline).await)
}

/// Lambda entry point. The SQS event source mapping delivers the messages,
/// so the queue URL is not needed here, only the warehouse and retry
/// settings. The warehouse connection is opened once per execution
/// environment and reused across invocations.
#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = WorkerConfig::from_env()?;
    config.warehouse.validate()?;
    config.retry.validate()?;

    let (_, pipeline) = connect_pipeline(&config).await?;

    lambda_runtime::run(service_fn(move |event: LambdaEvent<SqsEvent>| {
        lambda_handler(event, pipeline.clone())
    }))
    .await
}
