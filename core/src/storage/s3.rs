use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use tracing::{debug, instrument};

use crate::errors::FetchError;
use crate::extractor::ObjectStore;
use crate::notification::ObjectReference;

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, object), fields(object = %object))]
    async fn download(&self, object: &ObjectReference) -> Result<Vec<u8>, FetchError> {
        debug!("Downloading object");

        let response = match self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let no_such_key = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                let status = err.raw_response().map(|r| r.status().as_u16());
                return Err(classify_failure(
                    object,
                    no_such_key,
                    status,
                    DisplayErrorContext(&err).to_string(),
                ));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| FetchError::Transient {
                bucket: object.bucket.clone(),
                key: object.key.clone(),
                reason: format!("failed to read response body: {e}"),
            })?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded object");
        Ok(data)
    }
}

fn classify_failure(
    object: &ObjectReference,
    no_such_key: bool,
    status: Option<u16>,
    reason: String,
) -> FetchError {
    let bucket = object.bucket.clone();
    let key = object.key.clone();
    match (no_such_key, status) {
        (true, _) | (_, Some(404)) => FetchError::NotFound { bucket, key },
        (_, Some(403)) => FetchError::AccessDenied { bucket, key },
        _ => FetchError::Transient {
            bucket,
            key,
            reason,
        },
    }
}
