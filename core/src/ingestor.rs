use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{PollMode, WorkerConfig};
use crate::errors::IngestionError;
use crate::extractor::{ObjectStore, RecordExtractor};
use crate::notification::{Notification, ObjectReference, parse_notification};
use crate::policy::{
    DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT, DeadLetterSink, RetryPolicy, ThresholdPolicy,
};
use crate::record::TableSchema;
use crate::sink::{SinkLoader, Warehouse};
use crate::source::{MessageQueue, QueueMessage, ReceiveRequest};
use crate::telemetry::IngestMetrics;

/// Everything downstream of the queue: where objects come from, where
/// records go, and what happens to messages that keep failing.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub schema: TableSchema,
    pub policy: Arc<dyn RetryPolicy>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        schema: TableSchema,
    ) -> Self {
        Self {
            store,
            warehouse,
            schema,
            policy: Arc::new(ThresholdPolicy::default()),
            dead_letter: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub poll_mode: PollMode,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
    /// The loop gives up after this many receive failures in a row.
    pub max_consecutive_receive_errors: u32,
    pub receive_backoff_initial: Duration,
    pub receive_backoff_max: Duration,
    /// Once a message has been delivered this many times it is deleted even
    /// if the dead-letter sink refuses it.
    pub dead_letter_max_receive_count: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_mode: PollMode::DrainOnce,
            visibility_timeout: Duration::from_secs(3600),
            wait_time: Duration::from_secs(1),
            max_consecutive_receive_errors: 5,
            receive_backoff_initial: Duration::from_secs(1),
            receive_backoff_max: Duration::from_secs(30),
            dead_letter_max_receive_count: DEFAULT_DEAD_LETTER_MAX_RECEIVE_COUNT,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            poll_mode: config.queue.poll_mode,
            visibility_timeout: config.queue.visibility_timeout(),
            wait_time: config.queue.wait_time(),
            dead_letter_max_receive_count: config.retry.dead_letter_max_receive_count,
            ..Self::default()
        }
    }
}

/// How a single processing attempt ended. Every variant either removed the
/// message from the queue or left it there, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Loaded and deleted.
    Acknowledged { rows: usize },
    /// S3 configuration test event, deleted without processing.
    TestEventSkipped,
    /// Failed; the message reappears once its visibility timeout expires.
    LeftForRedelivery,
    /// Failed too often; deleted, after forwarding it when a dead-letter sink is set.
    Abandoned { dead_lettered: bool },
    /// The loop decided to delete but the queue refused, so the message will be redelivered.
    DeleteFailed,
}

enum Processed {
    Loaded {
        object: ObjectReference,
        rows: usize,
        bytes: usize,
    },
    TestEvent,
}

/// The ingestor drives messages from the queue through
/// parse -> fetch/decode -> load and then acknowledges or retries them.
pub struct Ingestor {
    queue: Arc<dyn MessageQueue>,
    extractor: RecordExtractor,
    loader: SinkLoader,
    policy: Arc<dyn RetryPolicy>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    settings: LoopSettings,
    metrics: IngestMetrics,
}

impl Ingestor {
    pub fn new(queue: Arc<dyn MessageQueue>, pipeline: Pipeline, settings: LoopSettings) -> Self {
        Self {
            queue,
            extractor: RecordExtractor::new(pipeline.store),
            loader: SinkLoader::new(pipeline.warehouse, pipeline.schema),
            policy: pipeline.policy,
            dead_letter: pipeline.dead_letter,
            settings,
            metrics: IngestMetrics::default(),
        }
    }

    /// Polls until the queue is drained (`DrainOnce`) or shutdown is
    /// requested (`LongPoll`). Shutdown is only observed between messages.
    ///
    /// Per-message failures never end the loop. Only repeated receive
    /// failures do.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<IngestMetrics, IngestionError> {
        info!(
            poll_mode = ?self.settings.poll_mode,
            visibility_timeout_secs = self.settings.visibility_timeout.as_secs(),
            table = self.loader.schema().table(),
            "Starting ingestion loop"
        );

        let mut consecutive_errors = 0u32;
        let mut backoff = self.settings.receive_backoff_initial;

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(outcomes) if outcomes.is_empty() => {
                    consecutive_errors = 0;
                    backoff = self.settings.receive_backoff_initial;
                    if self.settings.poll_mode == PollMode::DrainOnce {
                        info!("There are no messages, queue drained");
                        break;
                    }
                    debug!("Empty receive, polling again");
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    backoff = self.settings.receive_backoff_initial;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.metrics.receive_errors += 1;
                    if consecutive_errors >= self.settings.max_consecutive_receive_errors {
                        error!(error = %e, consecutive_errors, "Giving up after repeated receive failures");
                        return Err(e);
                    }
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Receive failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.receive_backoff_max);
                }
            }
        }

        info!(metrics = ?self.metrics, "Ingestion loop finished");
        Ok(self.metrics.clone())
    }

    /// One receive followed by processing of whatever came back. An empty
    /// result means the queue had nothing visible.
    pub async fn run_once(&mut self) -> Result<Vec<Outcome>, IngestionError> {
        debug!("Requesting message in queue");
        let messages = self.queue.receive(self.receive_request()).await?;

        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.handle_message(message).await);
        }
        Ok(outcomes)
    }

    #[instrument(skip_all, fields(message_id = message.id()))]
    pub async fn handle_message(&mut self, message: QueueMessage) -> Outcome {
        self.metrics.messages_received += 1;

        let receive_count = match message.receive_count() {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, body = %message.body, "Cannot evaluate retry policy");
                return self.abandon(&message, &e, None).await;
            }
        };

        match self.process(&message).await {
            Ok(Processed::Loaded {
                object,
                rows,
                bytes,
            }) => {
                if !self.delete(&message).await {
                    return Outcome::DeleteFailed;
                }
                self.metrics.messages_acknowledged += 1;
                self.metrics.rows_loaded += rows;
                self.metrics.bytes_fetched += bytes as u64;
                info!(%object, rows, "Successfully processed and ingested object");
                Outcome::Acknowledged { rows }
            }
            Ok(Processed::TestEvent) => {
                if !self.delete(&message).await {
                    return Outcome::DeleteFailed;
                }
                self.metrics.test_events_skipped += 1;
                info!("Skipped S3 test event");
                Outcome::TestEventSkipped
            }
            Err(e) => {
                error!(
                    error = %e,
                    kind = e.kind(),
                    content_error = e.is_content_error(),
                    receive_count,
                    body = %message.body,
                    "Error processing message"
                );

                if e.forces_abandon() || self.policy.should_abandon(receive_count) {
                    self.abandon(&message, &e, Some(receive_count)).await
                } else {
                    self.metrics.messages_left_for_redelivery += 1;
                    info!(receive_count, "Message left for redelivery");
                    Outcome::LeftForRedelivery
                }
            }
        }
    }

    pub fn get_metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: 1,
            visibility_timeout: self.settings.visibility_timeout,
            wait_time: self.settings.wait_time,
        }
    }

    async fn process(&self, message: &QueueMessage) -> Result<Processed, IngestionError> {
        let object = match parse_notification(&message.body)? {
            Notification::TestEvent => return Ok(Processed::TestEvent),
            Notification::Object(object) => object,
        };

        info!(%object, "Transforming data");
        let extracted = self.extractor.extract(&object).await?;

        info!(%object, rows = extracted.batch.len(), "Ingesting data in warehouse");
        let rows = self.loader.load(&extracted.batch).await?;

        Ok(Processed::Loaded {
            object,
            rows,
            bytes: extracted.object_size,
        })
    }

    async fn abandon(
        &mut self,
        message: &QueueMessage,
        cause: &IngestionError,
        receive_count: Option<u32>,
    ) -> Outcome {
        let mut dead_lettered = false;
        if let Some(sink) = &self.dead_letter {
            match sink.forward(message, &cause.to_string()).await {
                Ok(()) => dead_lettered = true,
                Err(e) => {
                    self.metrics.dead_letter_failures += 1;
                    // without a receive count there is nothing to bound redelivery by
                    let exhausted = receive_count
                        .is_none_or(|count| count >= self.settings.dead_letter_max_receive_count);
                    if !exhausted {
                        error!(
                            error = %e,
                            receive_count,
                            dead_letter_max_receive_count = self.settings.dead_letter_max_receive_count,
                            "Failed to forward message to dead-letter queue, leaving it for redelivery"
                        );
                        self.metrics.messages_left_for_redelivery += 1;
                        return Outcome::LeftForRedelivery;
                    }
                    error!(
                        error = %e,
                        receive_count,
                        body = %message.body,
                        "Failed to forward message to dead-letter queue, deleting it anyway"
                    );
                }
            }
        }

        if !self.delete(message).await {
            return Outcome::DeleteFailed;
        }

        self.metrics.messages_abandoned += 1;
        if dead_lettered {
            self.metrics.messages_dead_lettered += 1;
        }
        error!(
            receipt_handle = %message.receipt_handle,
            receive_count,
            dead_lettered,
            body = %message.body,
            "Message has been deleted after repeated failures"
        );
        Outcome::Abandoned { dead_lettered }
    }

    async fn delete(&mut self, message: &QueueMessage) -> bool {
        match self.queue.delete(&message.receipt_handle).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.delete_failures += 1;
                error!(error = %e, "Failed to delete message, it will be redelivered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{QueueError, SinkError};
    use crate::extractor::MockObjectStore;
    use crate::policy::MockDeadLetterSink;
    use crate::record::DEFAULT_TABLE;
    use crate::sink::MockWarehouse;
    use crate::source::{MockMessageQueue, RECEIVE_COUNT_ATTRIBUTE};
    use std::collections::HashMap;

    const LINE: &str = r#"{"transaction_id":1,"transaction_date":"2023-01-01","transaction_time":"07:06:11","transaction_qty":2,"store_id":5,"store_location":"Lower Manhattan","product_id":32,"unit_price":3.0,"product_category":"Coffee","product_type":"Gourmet brewed coffee","product_detail":"Ethiopia Rg"}"#;

    fn message(receive_count: &str) -> QueueMessage {
        QueueMessage {
            message_id: Some("m-1".to_string()),
            body: r#"{"Records":[{"s3":{"bucket":{"name":"b1"},"object":{"key":"orders/2024-01-01.json"}}}]}"#
                .to_string(),
            receipt_handle: "rh-1".to_string(),
            attributes: HashMap::from([(
                RECEIVE_COUNT_ATTRIBUTE.to_string(),
                receive_count.to_string(),
            )]),
        }
    }

    fn store_with(content: &'static str) -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store
            .expect_download()
            .returning(move |_| Ok(content.as_bytes().to_vec()));
        store
    }

    fn warehouse_down() -> MockWarehouse {
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().returning(|_| {
            Err(SinkError::Connection {
                reason: "connection refused".to_string(),
            })
        });
        warehouse
    }

    fn ingestor(queue: MockMessageQueue, store: MockObjectStore, warehouse: MockWarehouse) -> Ingestor {
        let pipeline = Pipeline::new(
            Arc::new(store),
            Arc::new(warehouse),
            TableSchema::sales(DEFAULT_TABLE),
        );
        Ingestor::new(Arc::new(queue), pipeline, LoopSettings::default())
    }

    #[tokio::test]
    async fn test_success_deletes_message() {
        let mut queue = MockMessageQueue::new();
        queue
            .expect_delete()
            .withf(|handle| handle == "rh-1")
            .times(1)
            .returning(|_| Ok(()));
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().times(2).returning(|_| Ok(1));

        let mut ingestor = ingestor(queue, store_with(LINE), warehouse);
        let outcome = ingestor.handle_message(message("1")).await;

        assert_eq!(outcome, Outcome::Acknowledged { rows: 1 });
        assert_eq!(ingestor.get_metrics().rows_loaded, 1);
        assert_eq!(ingestor.get_metrics().bytes_fetched, LINE.len() as u64);
    }

    #[tokio::test]
    async fn test_first_failure_is_left_for_redelivery() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().never();

        let mut ingestor = ingestor(queue, store_with(LINE), warehouse_down());
        assert_eq!(
            ingestor.handle_message(message("1")).await,
            Outcome::LeftForRedelivery
        );
        assert_eq!(ingestor.get_metrics().messages_left_for_redelivery, 1);
    }

    #[tokio::test]
    async fn test_second_failure_abandons() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_| Ok(()));

        let mut ingestor = ingestor(queue, store_with(LINE), warehouse_down());
        assert_eq!(
            ingestor.handle_message(message("2")).await,
            Outcome::Abandoned {
                dead_lettered: false
            }
        );
        assert_eq!(ingestor.get_metrics().messages_abandoned, 1);
    }

    #[tokio::test]
    async fn test_unparsable_receive_count_abandons_without_processing() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_| Ok(()));
        let mut store = MockObjectStore::new();
        store.expect_download().never();
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().never();

        let mut ingestor = ingestor(queue, store, warehouse);
        assert_eq!(
            ingestor.handle_message(message("many")).await,
            Outcome::Abandoned {
                dead_lettered: false
            }
        );
    }

    #[tokio::test]
    async fn test_abandoned_message_is_dead_lettered_first() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_| Ok(()));
        let mut dead_letter = MockDeadLetterSink::new();
        dead_letter
            .expect_forward()
            .withf(|message, reason| message.receipt_handle == "rh-1" && reason.contains("connection refused"))
            .times(1)
            .returning(|_, _| Ok(()));

        let pipeline = Pipeline::new(
            Arc::new(store_with(LINE)),
            Arc::new(warehouse_down()),
            TableSchema::sales(DEFAULT_TABLE),
        )
        .with_dead_letter(Arc::new(dead_letter));
        let mut ingestor = Ingestor::new(Arc::new(queue), pipeline, LoopSettings::default());

        assert_eq!(
            ingestor.handle_message(message("2")).await,
            Outcome::Abandoned {
                dead_lettered: true
            }
        );
        assert_eq!(ingestor.get_metrics().messages_dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_failed_dead_letter_keeps_message() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().never();
        let mut dead_letter = MockDeadLetterSink::new();
        dead_letter.expect_forward().times(1).returning(|_, _| {
            Err(QueueError::Send {
                queue_url: "dlq".to_string(),
                reason: "throttled".to_string(),
            })
        });

        let pipeline = Pipeline::new(
            Arc::new(store_with(LINE)),
            Arc::new(warehouse_down()),
            TableSchema::sales(DEFAULT_TABLE),
        )
        .with_dead_letter(Arc::new(dead_letter));
        let mut ingestor = Ingestor::new(Arc::new(queue), pipeline, LoopSettings::default());

        assert_eq!(
            ingestor.handle_message(message("2")).await,
            Outcome::LeftForRedelivery
        );
    }

    fn unreachable_dead_letter() -> MockDeadLetterSink {
        let mut dead_letter = MockDeadLetterSink::new();
        dead_letter.expect_forward().times(1).returning(|_, _| {
            Err(QueueError::Send {
                queue_url: "dlq".to_string(),
                reason: "queue does not exist".to_string(),
            })
        });
        dead_letter
    }

    #[tokio::test]
    async fn test_dead_letter_outage_deletes_at_receive_bound() {
        let mut queue = MockMessageQueue::new();
        queue
            .expect_delete()
            .withf(|handle| handle == "rh-1")
            .times(1)
            .returning(|_| Ok(()));

        let pipeline = Pipeline::new(
            Arc::new(store_with(LINE)),
            Arc::new(warehouse_down()),
            TableSchema::sales(DEFAULT_TABLE),
        )
        .with_dead_letter(Arc::new(unreachable_dead_letter()));
        let settings = LoopSettings {
            dead_letter_max_receive_count: 3,
            ..LoopSettings::default()
        };
        let mut ingestor = Ingestor::new(Arc::new(queue), pipeline, settings);

        assert_eq!(
            ingestor.handle_message(message("3")).await,
            Outcome::Abandoned {
                dead_lettered: false
            }
        );
        assert_eq!(ingestor.get_metrics().dead_letter_failures, 1);
        assert_eq!(ingestor.get_metrics().messages_abandoned, 1);
        assert_eq!(ingestor.get_metrics().messages_dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_outage_without_receive_count_deletes() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_| Ok(()));
        let mut store = MockObjectStore::new();
        store.expect_download().never();

        let pipeline = Pipeline::new(
            Arc::new(store),
            Arc::new(MockWarehouse::new()),
            TableSchema::sales(DEFAULT_TABLE),
        )
        .with_dead_letter(Arc::new(unreachable_dead_letter()));
        let mut ingestor = Ingestor::new(Arc::new(queue), pipeline, LoopSettings::default());

        assert_eq!(
            ingestor.handle_message(message("")).await,
            Outcome::Abandoned {
                dead_lettered: false
            }
        );
    }

    #[tokio::test]
    async fn test_failed_delete_is_reported() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_| {
            Err(QueueError::Delete {
                reason: "receipt handle expired".to_string(),
            })
        });
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().returning(|_| Ok(1));

        let mut ingestor = ingestor(queue, store_with(LINE), warehouse);
        assert_eq!(ingestor.handle_message(message("1")).await, Outcome::DeleteFailed);
        assert_eq!(ingestor.get_metrics().delete_failures, 1);
        assert_eq!(ingestor.get_metrics().messages_acknowledged, 0);
    }

    #[tokio::test]
    async fn test_test_event_is_acknowledged_without_loading() {
        let mut queue = MockMessageQueue::new();
        queue.expect_delete().times(1).returning(|_| Ok(()));
        let mut store = MockObjectStore::new();
        store.expect_download().never();
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().never();

        let mut test_event = message("1");
        test_event.body = r#"{"Service":"Amazon S3","Event":"s3:TestEvent","Bucket":"b1"}"#.to_string();

        let mut ingestor = ingestor(queue, store, warehouse);
        assert_eq!(
            ingestor.handle_message(test_event).await,
            Outcome::TestEventSkipped
        );
    }

    #[tokio::test]
    async fn test_receive_request_asks_for_one_message() {
        let mut queue = MockMessageQueue::new();
        queue
            .expect_receive()
            .withf(|request| {
                request.max_messages == 1 && request.visibility_timeout == Duration::from_secs(3600)
            })
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut ingestor = ingestor(queue, MockObjectStore::new(), MockWarehouse::new());
        let metrics = ingestor.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(metrics, IngestMetrics::default());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_polling() {
        let mut queue = MockMessageQueue::new();
        queue.expect_receive().never();

        let token = CancellationToken::new();
        token.cancel();

        let mut ingestor = ingestor(queue, MockObjectStore::new(), MockWarehouse::new());
        assert!(ingestor.run(&token).await.is_ok());
    }
}
