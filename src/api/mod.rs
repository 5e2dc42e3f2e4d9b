use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connectivity::ConnectivityProbe;
use crate::tracker::LocationSink;

pub mod model;

pub use model::{
    LocationUpdate, RecordResult, RecordStatus, RejectReason, SyncBatch, SyncBatchResponse,
    SyncRecord,
};

/// Failure talking to the sync server, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Timeout, connection failure, 5xx or 429. The same request may succeed later.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The server refused the request as a whole (4xx). Resending it unchanged is pointless.
    #[error("request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
    /// The request never left the client: the endpoint could not be built from the base URL.
    #[error("invalid endpoint {path}: {message}")]
    Endpoint { path: String, message: String },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transient(err.to_string())
    }
}

/// Remote side of the outbox: one call per batch of a single kind.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<SyncBatchResponse, ApiError>;
}

#[derive(Clone)]
pub struct HttpSyncApi {
    http: Client,
    base_url: Url,
    batch_url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpSyncApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSyncApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSyncApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid sync server base URL")?;
        let batch_url = base_url
            .join("v1/sync/batch")
            .with_context(|| format!("{} cannot be used as a sync server base URL", base_url))?;
        let http = Client::builder()
            .user_agent("nursing-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            batch_url,
            token,
        })
    }

    pub fn from_config(cfg: &crate::config::Config) -> Result<Self> {
        Self::new(
            &cfg.server.base_url,
            cfg.server.api_token.clone(),
            Duration::from_millis(cfg.sync.batch_timeout_ms),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url.join(path).map_err(|e| ApiError::Endpoint {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut req = self.authorize(self.http.request(method.clone(), url.clone()));
        if let Some(body) = body {
            req = req.json(body);
        }
        debug!(%method, %url, authorized = self.token.is_some(), "sync server request");

        let res = req.send().await?;
        let status = res.status();
        debug!(%status, %url, "sync server response");

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "sync server unavailable");
            return Err(ApiError::Transient(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "sync server rejected request");
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res)
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &B,
    ) -> Result<T, ApiError> {
        let res = self.send(method, url, Some(body)).await?;
        let text = res.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::Transient(format!("invalid response JSON: {}", e)))
    }

    pub async fn push_location(
        &self,
        practitioner_id: Uuid,
        update: &LocationUpdate,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("v1/practitioners/{}/location", practitioner_id))?;
        self.send(reqwest::Method::PUT, url, Some(update)).await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<(), ApiError> {
        let url = self.endpoint("health")?;
        self.send::<()>(reqwest::Method::GET, url, None).await?;
        Ok(())
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn submit_batch(&self, batch: &SyncBatch) -> Result<SyncBatchResponse, ApiError> {
        self.send_json(reqwest::Method::POST, self.batch_url.clone(), batch)
            .await
    }
}

#[async_trait]
impl LocationSink for HttpSyncApi {
    async fn publish(&self, practitioner_id: Uuid, update: &LocationUpdate) -> Result<()> {
        self.push_location(practitioner_id, update)
            .await
            .context("failed to publish location")
    }
}

#[async_trait]
impl ConnectivityProbe for HttpSyncApi {
    async fn probe(&self) -> bool {
        self.health().await.is_ok()
    }
}
