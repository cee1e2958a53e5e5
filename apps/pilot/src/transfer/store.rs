use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid presigned url: {0}")]
    InvalidUrl(String),
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResponse {
    pub status: u16,
    pub body: Bytes,
}

impl StoreResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP side of a transfer: one call per presigned URL, no auth of its own.
/// Status interpretation is left to the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, url: &str, body: Bytes) -> Result<StoreResponse, StoreError>;
    async fn get(&self, url: &str) -> Result<StoreResponse, StoreError>;
    async fn delete(&self, url: &str) -> Result<StoreResponse, StoreError>;
}

pub struct HttpObjectStore {
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    async fn finish(response: reqwest::Response) -> Result<StoreResponse, StoreError> {
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::Network(err.to_string()))?;
        Ok(StoreResponse { status, body })
    }
}

pub(crate) fn parse_presigned(url: &str) -> Result<Url, StoreError> {
    let parsed = Url::parse(url).map_err(|err| StoreError::InvalidUrl(format!("{url}: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(StoreError::InvalidUrl(format!(
            "{url}: unsupported scheme {other}"
        ))),
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, url: &str, body: Bytes) -> Result<StoreResponse, StoreError> {
        let url = parse_presigned(url)?;
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await
            .map_err(|err| StoreError::Network(err.to_string()))?;
        Self::finish(response).await
    }

    async fn get(&self, url: &str) -> Result<StoreResponse, StoreError> {
        let url = parse_presigned(url)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| StoreError::Network(err.to_string()))?;
        Self::finish(response).await
    }

    async fn delete(&self, url: &str) -> Result<StoreResponse, StoreError> {
        let url = parse_presigned(url)?;
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|err| StoreError::Network(err.to_string()))?;
        Self::finish(response).await
    }
}
