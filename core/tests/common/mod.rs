#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use ingest_core::errors::{FetchError, QueueError, SinkError};
use ingest_core::extractor::ObjectStore;
use ingest_core::ingestor::{Ingestor, LoopSettings, Pipeline};
use ingest_core::notification::ObjectReference;
use ingest_core::policy::DeadLetterSink;
use ingest_core::record::{DEFAULT_TABLE, TableSchema};
use ingest_core::source::{MessageQueue, QueueMessage, RECEIVE_COUNT_ATTRIBUTE, ReceiveRequest};

pub const BUCKET: &str = "landing-zone";

pub fn sales_line(id: i64, detail: &str) -> String {
    format!(
        r#"{{"transaction_id":{id},"transaction_date":"2023-01-01","transaction_time":"07:06:11","transaction_qty":2,"store_id":5,"store_location":"Lower Manhattan","product_id":32,"unit_price":3.0,"product_category":"Coffee","product_type":"Gourmet brewed coffee","product_detail":"{detail}"}}"#
    )
}

pub fn s3_event(bucket: &str, key: &str) -> String {
    format!(
        r#"{{"Records":[{{"eventSource":"aws:s3","eventName":"ObjectCreated:Put","s3":{{"bucket":{{"name":"{bucket}"}},"object":{{"key":"{key}","size":42}}}}}}]}}"#
    )
}

struct StoredMessage {
    id: String,
    body: String,
    receive_count: u32,
    receive_count_override: Option<String>,
    receipt_handle: Option<String>,
    visible: bool,
}

/// In-memory queue with SQS-like visibility: a received message is hidden
/// until deleted or until `expire_visibility` is called, and every delivery
/// bumps its receive count.
#[derive(Default)]
pub struct FakeQueue {
    messages: Mutex<Vec<StoredMessage>>,
    next_id: AtomicUsize,
    receive_calls: AtomicUsize,
    failing_receives: AtomicUsize,
    cancel_when_empty: Mutex<Option<CancellationToken>>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, body: impl Into<String>) -> String {
        self.push_message(body.into(), None)
    }

    /// Pushes a message whose receive count attribute is reported verbatim.
    pub fn push_with_receive_count(&self, body: impl Into<String>, raw_count: &str) -> String {
        self.push_message(body.into(), Some(raw_count.to_string()))
    }

    fn push_message(&self, body: String, receive_count_override: Option<String>) -> String {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.messages.lock().unwrap().push(StoredMessage {
            id: id.clone(),
            body,
            receive_count: 0,
            receive_count_override,
            receipt_handle: None,
            visible: true,
        });
        id
    }

    /// Makes every in-flight message visible again, as if its visibility
    /// timeout had elapsed.
    pub fn expire_visibility(&self) {
        for message in self.messages.lock().unwrap().iter_mut() {
            message.visible = true;
            message.receipt_handle = None;
        }
    }

    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    pub fn cancel_when_empty(&self, token: CancellationToken) {
        *self.cancel_when_empty.lock().unwrap() = Some(token);
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn receive_count_of(&self, id: &str) -> Option<u32> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.receive_count)
    }
}

#[async_trait]
impl MessageQueue for FakeQueue {
    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_receives.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_receives.store(failing - 1, Ordering::SeqCst);
            return Err(QueueError::Receive {
                reason: "service unavailable".to_string(),
            });
        }

        let mut messages = self.messages.lock().unwrap();
        let mut received = Vec::new();
        for message in messages.iter_mut().filter(|m| m.visible) {
            if received.len() >= request.max_messages as usize {
                break;
            }
            message.visible = false;
            message.receive_count += 1;
            let handle = format!("{}-delivery-{}", message.id, message.receive_count);
            message.receipt_handle = Some(handle.clone());

            let count = message
                .receive_count_override
                .clone()
                .unwrap_or_else(|| message.receive_count.to_string());
            received.push(QueueMessage {
                message_id: Some(message.id.clone()),
                body: message.body.clone(),
                receipt_handle: handle,
                attributes: HashMap::from([(RECEIVE_COUNT_ATTRIBUTE.to_string(), count)]),
            });
        }

        if received.is_empty() {
            if let Some(token) = self.cancel_when_empty.lock().unwrap().as_ref() {
                token.cancel();
            }
        }
        Ok(received)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if messages.len() == before {
            return Err(QueueError::Delete {
                reason: format!("receipt handle {receipt_handle} is not valid"),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<ObjectReference, Vec<u8>>>,
    downloads: AtomicUsize,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, content: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(ObjectReference::new(BUCKET, key), content.into());
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn download(&self, object: &ObjectReference) -> Result<Vec<u8>, FetchError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(object)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
            })
    }
}

/// Records every statement it is given. While `down` is set every call
/// fails as an unreachable cluster would.
#[derive(Default)]
pub struct FakeWarehouse {
    statements: Mutex<Vec<String>>,
    down: AtomicBool,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn inserts(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.starts_with("INSERT"))
            .collect()
    }
}

#[async_trait]
impl ingest_core::sink::Warehouse for FakeWarehouse {
    async fn execute(&self, sql: &str) -> Result<u64, SinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SinkError::Connection {
                reason: "could not connect to server: Connection refused".to_string(),
            });
        }
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(sql.matches("),\n(").count() as u64 + 1)
    }
}

#[derive(Default)]
pub struct FakeDeadLetter {
    forwarded: Mutex<Vec<(String, String)>>,
}

impl FakeDeadLetter {
    pub fn forwarded(&self) -> Vec<(String, String)> {
        self.forwarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for FakeDeadLetter {
    async fn forward(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        self.forwarded
            .lock()
            .unwrap()
            .push((message.body.clone(), reason.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub queue: Arc<FakeQueue>,
    pub store: Arc<FakeStore>,
    pub warehouse: Arc<FakeWarehouse>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(FakeQueue::new()),
            store: Arc::new(FakeStore::new()),
            warehouse: Arc::new(FakeWarehouse::new()),
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.store.clone(),
            self.warehouse.clone(),
            TableSchema::sales(DEFAULT_TABLE),
        )
    }

    pub fn ingestor(&self, settings: LoopSettings) -> Ingestor {
        Ingestor::new(self.queue.clone(), self.pipeline(), settings)
    }
}
