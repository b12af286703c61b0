use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{
    Message, MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName,
};
use tracing::{debug, instrument, warn};

use crate::errors::QueueError;
use crate::policy::DeadLetterSink;
use crate::source::{MessageQueue, QueueMessage, ReceiveRequest};

/// Amazon SQS queue consumed by the worker.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    #[instrument(skip(self), fields(queue_url = %self.queue_url))]
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(request.max_messages)
            .visibility_timeout(seconds(request.visibility_timeout.as_secs()))
            .wait_time_seconds(seconds(request.wait_time.as_secs()))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| QueueError::Receive {
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let messages: Vec<QueueMessage> = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(convert_message)
            .collect();

        debug!(count = messages.len(), "Received messages");
        Ok(messages)
    }

    #[instrument(skip(self, receipt_handle))]
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete {
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

/// Fetches the queue ARN once. Fails when the URL is wrong, the queue does
/// not exist, or the credentials cannot read it.
#[instrument(skip(client))]
pub async fn check_queue(client: &Client, queue_url: &str) -> Result<(), QueueError> {
    client
        .get_queue_attributes()
        .queue_url(queue_url)
        .attribute_names(QueueAttributeName::QueueArn)
        .send()
        .await
        .map_err(|e| QueueError::Unreachable {
            queue_url: queue_url.to_string(),
            reason: DisplayErrorContext(&e).to_string(),
        })?;

    debug!("Queue is reachable");
    Ok(())
}

fn seconds(secs: u64) -> i32 {
    i32::try_from(secs).unwrap_or(i32::MAX)
}

fn convert_message(message: Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle else {
        warn!(message_id = ?message.message_id, "Message has no receipt handle, skipping");
        return None;
    };

    let attributes = message
        .attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| (name.as_str().to_string(), value))
        .collect();

    Some(QueueMessage {
        message_id: message.message_id,
        body: message.body.unwrap_or_default(),
        receipt_handle,
        attributes,
    })
}

/// Forwards abandoned messages to a second SQS queue instead of dropping them.
pub struct SqsDeadLetterQueue {
    client: Client,
    queue_url: String,
}

impl SqsDeadLetterQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetterQueue {
    #[instrument(skip(self, message, reason), fields(message_id = message.id()))]
    async fn forward(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let send_error = |reason: String| QueueError::Send {
            queue_url: self.queue_url.clone(),
            reason,
        };

        let failure_reason = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(reason)
            .build()
            .map_err(|e| send_error(e.to_string()))?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .message_attributes("failure_reason", failure_reason)
            .send()
            .await
            .map_err(|e| send_error(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}
