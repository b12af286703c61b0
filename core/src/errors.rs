use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Malformed notification: {reason}")]
    MalformedNotification { reason: String },

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Failed to decode record on line {line}: {reason}")]
    Decode { line: usize, reason: String },

    #[error("Record batch does not match the table schema: {reason}")]
    SchemaMismatch { reason: String },

    #[error("Warehouse error: {0}")]
    Sink(#[from] SinkError),

    #[error("Queue protocol error: {reason}")]
    QueueProtocol { reason: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },

    #[error("Access denied to s3://{bucket}/{key}")]
    AccessDenied { bucket: String, key: String },

    #[error("Failed to download s3://{bucket}/{key}: {reason}")]
    Transient {
        bucket: String,
        key: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Warehouse connection failed: {reason}")]
    Connection { reason: String },

    #[error("Statement failed: {reason}")]
    Statement { reason: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to receive messages: {reason}")]
    Receive { reason: String },

    #[error("Failed to delete message: {reason}")]
    Delete { reason: String },

    #[error("Failed to send message to {queue_url}: {reason}")]
    Send { queue_url: String, reason: String },

    #[error("Queue {queue_url} is not reachable: {reason}")]
    Unreachable { queue_url: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl IngestionError {
    /// Short, stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionError::MalformedNotification { .. } => "malformed_notification",
            IngestionError::Fetch(_) => "fetch_error",
            IngestionError::Decode { .. } => "decode_error",
            IngestionError::SchemaMismatch { .. } => "schema_mismatch",
            IngestionError::Sink(_) => "sink_error",
            IngestionError::QueueProtocol { .. } => "queue_protocol_error",
            IngestionError::Queue(_) => "queue_error",
        }
    }

    /// Errors caused by the content of the message or object rather than by
    /// an unavailable collaborator. Retrying them is unlikely to help.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            IngestionError::MalformedNotification { .. }
                | IngestionError::Decode { .. }
                | IngestionError::SchemaMismatch { .. }
                | IngestionError::Fetch(FetchError::NotFound { .. })
        )
    }

    /// Errors for which the retry policy cannot be evaluated at all.
    pub fn forces_abandon(&self) -> bool {
        matches!(self, IngestionError::QueueProtocol { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_errors() {
        let decode = IngestionError::Decode {
            line: 3,
            reason: "missing field `store_id`".to_string(),
        };
        assert!(decode.is_content_error());
        assert_eq!(decode.kind(), "decode_error");
        assert_eq!(
            decode.to_string(),
            "Failed to decode record on line 3: missing field `store_id`"
        );

        let missing = IngestionError::from(FetchError::NotFound {
            bucket: "b1".to_string(),
            key: "a.json".to_string(),
        });
        assert!(missing.is_content_error());

        let sink = IngestionError::from(SinkError::Connection {
            reason: "connection refused".to_string(),
        });
        assert!(!sink.is_content_error());
        assert!(!sink.forces_abandon());
        assert_eq!(sink.kind(), "sink_error");
    }

    #[test]
    fn test_queue_protocol_forces_abandon() {
        let err = IngestionError::QueueProtocol {
            reason: "ApproximateReceiveCount is not a number".to_string(),
        };
        assert!(err.forces_abandon());
        assert!(!err.is_content_error());
    }

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::AccessDenied {
            bucket: "landing".to_string(),
            key: "orders/2024-01-01.json".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Access denied to s3://landing/orders/2024-01-01.json"
        );
    }

    #[test]
    fn test_queue_errors_are_loop_errors() {
        let err = IngestionError::from(QueueError::Unreachable {
            queue_url: "https://sqs.us-east-1.amazonaws.com/123456789012/landing".to_string(),
            reason: "AWS.SimpleQueueService.NonExistentQueue".to_string(),
        });
        assert_eq!(err.kind(), "queue_error");
        assert!(!err.is_content_error());
        assert!(err.to_string().contains("is not reachable"));
    }
}
