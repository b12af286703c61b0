use async_trait::async_trait;

use crate::errors::QueueError;
use crate::source::QueueMessage;

pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 2;
/// Receive count at which an abandoned message is deleted even though the
/// dead-letter sink keeps rejecting it.
pub const DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT: u32 = 5;

/// Decides whether a failed message should be dropped instead of left on
/// the queue for another delivery.
pub trait RetryPolicy: Send + Sync {
    fn should_abandon(&self, receive_count: u32) -> bool;
}

/// Abandons a message once it has been delivered `max_receive_count` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    max_receive_count: u32,
}

impl ThresholdPolicy {
    pub fn new(max_receive_count: u32) -> Self {
        Self {
            max_receive_count: max_receive_count.max(1),
        }
    }

    pub fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECEIVE_COUNT)
    }
}

impl RetryPolicy for ThresholdPolicy {
    fn should_abandon(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }
}

/// Destination for abandoned messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn forward(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError>;
}
