//! Snapshot Fetcher - one attempt at retrieving and parsing the feature-layer feed

use crate::error::FetchError;
use crate::record::RawRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Fetch capability: returns the raw response body for `url` + `query`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>, FetchError>;

    /// Short label for logs, e.g. "http" or "file".
    fn source_type(&self) -> &str;
}

/// Fetches over HTTP(S) with `reqwest`. Non-2xx responses are network errors.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("corona-collector/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, query: &[(String, String)]) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP {} from {}", status, url)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(format!("Failed to read response body: {}", e)))?;
        debug!("Downloaded {} bytes from {}", body.len(), url);
        Ok(body.to_vec())
    }

    fn source_type(&self) -> &str {
        "http"
    }
}

/// Reads a previously downloaded payload from disk instead of the server.
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, _url: &str, _query: &[(String, String)]) -> Result<Vec<u8>, FetchError> {
        let body = tokio::fs::read(&self.path).await.map_err(|e| {
            FetchError::Network(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        debug!("Read {} bytes from local file {}", body.len(), self.path.display());
        Ok(body)
    }

    fn source_type(&self) -> &str {
        "file"
    }
}

/// A successfully fetched and parsed payload.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub fetched_at: DateTime<Utc>,
    /// Verbatim response body, kept for archiving.
    pub raw: Vec<u8>,
    pub records: Vec<RawRecord>,
}

/// Wraps a fetch capability with the fixed dataset query.
pub struct SnapshotFetcher {
    fetcher: Box<dyn Fetcher>,
    url: String,
    query: Vec<(String, String)>,
}

impl SnapshotFetcher {
    pub fn new(fetcher: Box<dyn Fetcher>, url: impl Into<String>, query: Vec<(String, String)>) -> Self {
        Self {
            fetcher,
            url: url.into(),
            query,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Single attempt; retries belong to whoever schedules the cycles.
    pub async fn fetch(&self) -> Result<FetchedPayload, FetchError> {
        info!("Fetching snapshot from {} ({})", self.url, self.fetcher.source_type());
        let raw = self.fetcher.fetch(&self.url, &self.query).await?;
        let fetched_at = Utc::now();
        let records = parse_feature_layer(&raw)?;
        info!("Fetched {} records", records.len());
        Ok(FetchedPayload {
            fetched_at,
            raw,
            records,
        })
    }
}

/// Parse an ArcGIS feature-layer query response into its `attributes` objects.
pub fn parse_feature_layer(body: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let root: Value = serde_json::from_slice(body)
        .map_err(|e| FetchError::Malformed(format!("Body is not valid JSON: {}", e)))?;

    let root = root
        .as_object()
        .ok_or_else(|| FetchError::Malformed("Top-level value is not an object".to_string()))?;

    if let Some(error) = root.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(FetchError::Malformed(format!("Feed reported an error: {}", message)));
    }

    if root.get("exceededTransferLimit").and_then(Value::as_bool) == Some(true) {
        return Err(FetchError::Malformed(
            "Feed exceeded its transfer limit, snapshot is incomplete".to_string(),
        ));
    }

    let features = root
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Malformed("Missing 'features' array".to_string()))?;

    features
        .iter()
        .enumerate()
        .map(|(i, feature)| {
            feature
                .get("attributes")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| {
                    FetchError::Malformed(format!("Feature {} has no 'attributes' object", i))
                })
        })
        .collect()
}
