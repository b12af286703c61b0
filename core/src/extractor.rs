use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{FetchError, IngestionError};
use crate::notification::ObjectReference;
use crate::record::{RecordBatch, SalesRecord};

/// Download-by-key access to the object store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches the whole object into memory.
    async fn download(&self, object: &ObjectReference) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug)]
pub struct Extracted {
    pub batch: RecordBatch,
    pub object_size: usize,
}

/// Fetches a landed object and decodes it into a [`RecordBatch`].
#[derive(Clone)]
pub struct RecordExtractor {
    store: Arc<dyn ObjectStore>,
}

impl RecordExtractor {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn extract(&self, object: &ObjectReference) -> Result<Extracted, IngestionError> {
        let bytes = self.store.download(object).await?;
        debug!(%object, bytes = bytes.len(), "Downloaded object");

        let records = decode_records(&bytes)?;
        Ok(Extracted {
            batch: RecordBatch::from_records(records),
            object_size: bytes.len(),
        })
    }
}

/// Decodes newline-delimited JSON, one [`SalesRecord`] per non-blank line.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<SalesRecord>, IngestionError> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        let line = bytes[..e.valid_up_to()]
            .iter()
            .filter(|b| **b == b'\n')
            .count()
            + 1;
        IngestionError::Decode {
            line,
            reason: format!("content is not valid UTF-8: {e}"),
        }
    })?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<SalesRecord>(line).map_err(|e| IngestionError::Decode {
                line: index + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}
