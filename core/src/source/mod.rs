pub mod sqs;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::{IngestionError, QueueError};

/// System attribute carrying how many times a message has been delivered.
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// A message received from the queue. Owned by the loop for a single
/// processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    /// raw notification body
    pub body: String,
    /// opaque token used to acknowledge this delivery
    pub receipt_handle: String,
    /// system attributes, e.g. `ApproximateReceiveCount`
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    pub fn receive_count(&self) -> Result<u32, IngestionError> {
        let raw = self
            .attributes
            .get(RECEIVE_COUNT_ATTRIBUTE)
            .ok_or_else(|| IngestionError::QueueProtocol {
                reason: format!("message has no {RECEIVE_COUNT_ATTRIBUTE} attribute"),
            })?;

        match raw.trim().parse::<u32>() {
            Ok(count) if count >= 1 => Ok(count),
            _ => Err(IngestionError::QueueProtocol {
                reason: format!("{RECEIVE_COUNT_ATTRIBUTE} `{raw}` is not a positive integer"),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: i32,
    /// how long a received message stays hidden from other consumers
    pub visibility_timeout: Duration,
    /// long-poll wait; zero means short polling
    pub wait_time: Duration,
}

/// Polled message queue with explicit acknowledgement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Returns up to `max_messages` messages. An empty vector means the queue
    /// had nothing visible within the wait time.
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledges a delivery, removing the message from the queue.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}
