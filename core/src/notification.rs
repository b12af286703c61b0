use serde::Deserialize;
use std::fmt;
use tracing::warn;

use crate::errors::IngestionError;

/// Location of a landed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub bucket: String,
    pub key: String,
}

impl ObjectReference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Object(ObjectReference),
    /// Sent once by S3 when a bucket notification is configured.
    TestEvent,
}

#[derive(Debug, Deserialize)]
struct S3EventNotification {
    #[serde(rename = "Records")]
    records: Option<Vec<S3EventRecord>>,
    #[serde(rename = "Event")]
    event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

const TEST_EVENT: &str = "s3:TestEvent";

pub fn parse_notification(body: &str) -> Result<Notification, IngestionError> {
    let envelope: S3EventNotification =
        serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;

    if envelope.event.as_deref() == Some(TEST_EVENT) {
        return Ok(Notification::TestEvent);
    }

    let mut records = envelope
        .records
        .ok_or_else(|| malformed("missing `Records`"))?
        .into_iter();
    let record = records
        .next()
        .ok_or_else(|| malformed("`Records` is empty"))?;

    let extra = records.len();
    if extra > 0 {
        warn!(extra, "Notification carries more than one record, only the first is ingested");
    }

    let bucket = record.s3.bucket.name;
    if bucket.is_empty() {
        return Err(malformed("empty bucket name"));
    }
    let key = decode_object_key(&record.s3.object.key)?;
    if key.is_empty() {
        return Err(malformed("empty object key"));
    }

    Ok(Notification::Object(ObjectReference { bucket, key }))
}

/// S3 form-encodes object keys in notifications: `+` stands for a space and
/// everything else is percent-encoded UTF-8.
pub fn decode_object_key(raw: &str) -> Result<String, IngestionError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| malformed(format!("object key `{raw}` is not valid UTF-8: {e}")))
}

fn malformed(reason: impl Into<String>) -> IngestionError {
    IngestionError::MalformedNotification {
        reason: reason.into(),
    }
}
