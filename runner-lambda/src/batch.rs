use async_trait::async_trait;
use aws_lambda_events::event::sqs::{BatchItemFailure, SqsBatchResponse, SqsEvent, SqsMessage};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingest_core::config::PollMode;
use ingest_core::errors::QueueError;
use ingest_core::ingestor::{Ingestor, LoopSettings, Pipeline};
use ingest_core::source::{MessageQueue, QueueMessage, ReceiveRequest};

/// Presents an already-delivered Lambda batch as a queue. Deleting a
/// message marks it done; whatever is not deleted is reported back as a
/// failure so the event source mapping keeps it for redelivery.
pub struct BatchQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    delivered: Vec<(String, String)>,
    deleted: Mutex<HashSet<String>>,
}

impl BatchQueue {
    pub fn new(records: Vec<SqsMessage>) -> Self {
        let messages: Vec<QueueMessage> = records.into_iter().filter_map(convert_record).collect();
        let delivered = messages
            .iter()
            .map(|m| (m.id().to_string(), m.receipt_handle.clone()))
            .collect();

        Self {
            pending: Mutex::new(messages.into()),
            delivered,
            deleted: Mutex::new(HashSet::new()),
        }
    }

    /// Ids of delivered messages that were never deleted.
    pub fn failures(&self) -> Vec<String> {
        let deleted = self.deleted.lock().unwrap_or_else(|e| e.into_inner());
        self.delivered
            .iter()
            .filter(|(_, handle)| !deleted.contains(handle))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

// Lambda events always carry a message id; the receipt handle is only used
// as the local acknowledgement key.
fn convert_record(record: SqsMessage) -> Option<QueueMessage> {
    let Some(message_id) = record.message_id else {
        warn!("Dropping SQS record without a message id");
        return None;
    };

    Some(QueueMessage {
        receipt_handle: record.receipt_handle.unwrap_or_else(|| message_id.clone()),
        message_id: Some(message_id),
        body: record.body.unwrap_or_default(),
        attributes: record.attributes.into_iter().collect(),
    })
}

#[async_trait]
impl MessageQueue for BatchQueue {
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError> {
        let mut pending = self.pending.lock().map_err(|e| QueueError::Receive {
            reason: e.to_string(),
        })?;
        let take = usize::try_from(request.max_messages.max(1)).unwrap_or(1).min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.deleted
            .lock()
            .map_err(|e| QueueError::Delete {
                reason: e.to_string(),
            })?
            .insert(receipt_handle.to_string());
        Ok(())
    }
}

/// Runs every record of the batch through the pipeline and reports the ones
/// that must be redelivered, as a partial batch response for an event source
/// mapping with `ReportBatchItemFailures` enabled.
pub async fn process_batch(event: SqsEvent, pipeline: Pipeline) -> SqsBatchResponse {
    let queue = Arc::new(BatchQueue::new(event.records));
    let settings = LoopSettings {
        poll_mode: PollMode::DrainOnce,
        wait_time: Duration::ZERO,
        ..LoopSettings::default()
    };

    let mut ingestor = Ingestor::new(queue.clone(), pipeline, settings);
    match ingestor.run(&CancellationToken::new()).await {
        Ok(metrics) => info!(?metrics, "Batch processed"),
        Err(e) => error!(error = %e, "Batch processing stopped early"),
    }

    SqsBatchResponse {
        batch_item_failures: queue
            .failures()
            .into_iter()
            .map(|item_identifier| BatchItemFailure { item_identifier })
            .collect(),
    }
}
