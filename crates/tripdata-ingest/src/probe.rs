//! Remote source object probe
//!
//! Checks whether a partition's file is published on the trip record CDN
//! with an HTTP `HEAD`, without downloading it. Network failures and server
//! errors are retried under a linear backoff; `403` and `404` both mean the
//! object is absent (the CDN answers `403` for keys it does not know).

use crate::error::{IngestError, Result};
use crate::framework::retry::{Classification, RetryPolicy};
use crate::framework::storage::SourceLocator;
use crate::framework::types::Partition;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, instrument};

/// Public location of the monthly trip record files
pub const DEFAULT_SOURCE_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

pub struct HttpSourceProbe {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpSourceProbe {
    pub fn new(base_url: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tripdata-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn object_url(&self, partition: &Partition) -> String {
        format!("{}/{}", self.base_url, partition.source_object_name())
    }

    async fn head(&self, url: &str) -> Result<bool> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| IngestError::TransientLoad(format!("HEAD {}: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            status if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => Err(
                IngestError::TransientLoad(format!("HEAD {} returned {}", url, status)),
            ),
            status => Err(IngestError::PermanentLoad(format!(
                "HEAD {} returned {}",
                url, status
            ))),
        }
    }
}

#[async_trait]
impl SourceLocator for HttpSourceProbe {
    #[instrument(skip_all, fields(partition = %partition))]
    async fn exists(&self, partition: &Partition) -> Result<bool> {
        let url = self.object_url(partition);
        let classify = |err: &IngestError| {
            if err.is_retryable() {
                Classification::Retryable
            } else {
                Classification::Permanent
            }
        };

        let found = self
            .retry
            .execute(None, classify, |_| self.head(&url))
            .await
            .map_err(|failure| failure.error)?;

        debug!(url = %url, found = found.value, attempts = found.attempts, "Source object probed");
        Ok(found.value)
    }
}
