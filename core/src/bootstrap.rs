use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use std::sync::Arc;
use tracing::info;

use crate::config::{AwsConfig, WorkerConfig};
use crate::ingestor::Pipeline;
use crate::policy::ThresholdPolicy;
use crate::record::TableSchema;
use crate::sink::redshift::RedshiftWarehouse;
use crate::source::sqs::{SqsDeadLetterQueue, check_queue};
use crate::storage::S3ObjectStore;

pub async fn load_aws_config(aws: &AwsConfig) -> aws_config::SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &aws.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint) = &aws.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

/// Builds the AWS clients and opens the warehouse connection. A warehouse or
/// queue that cannot be reached is fatal here, before any message is consumed.
/// The consumed queue is only checked when `queue.url` is set; the Lambda
/// runner receives its messages from the event source mapping instead.
pub async fn connect_pipeline(config: &WorkerConfig) -> Result<(aws_sdk_sqs::Client, Pipeline)> {
    let sdk_config = load_aws_config(&config.aws).await;

    // custom endpoints (LocalStack, MinIO) rarely support virtual-hosted buckets
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(config.aws.endpoint_url.is_some())
        .build();
    let s3 = aws_sdk_s3::Client::from_conf(s3_config);
    let sqs = aws_sdk_sqs::Client::new(&sdk_config);

    if !config.queue.url.is_empty() {
        check_queue(&sqs, &config.queue.url)
            .await
            .context("Failed to reach the notification queue")?;
    }

    let warehouse = RedshiftWarehouse::connect(&config.warehouse)
        .await
        .context("Failed to connect to warehouse")?;

    let mut pipeline = Pipeline::new(
        Arc::new(S3ObjectStore::new(s3)),
        Arc::new(warehouse),
        TableSchema::sales(&config.warehouse.table),
    )
    .with_policy(Arc::new(ThresholdPolicy::new(
        config.retry.max_receive_count,
    )));

    if let Some(url) = &config.queue.dead_letter_url {
        check_queue(&sqs, url)
            .await
            .context("Failed to reach the dead-letter queue")?;
        info!(dead_letter_url = %url, "Abandoned messages will be forwarded");
        pipeline = pipeline.with_dead_letter(Arc::new(SqsDeadLetterQueue::new(sqs.clone(), url)));
    }

    Ok((sqs, pipeline))
}
