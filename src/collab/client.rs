//! Collaboration framework API client
//!
//! High-level CRUD client for the pentest collaboration backend. Transient
//! failures are retried a bounded number of times with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::collab::types::{ListQuery, Resource};
use crate::config::Config;
use crate::error::UpstreamError;

/// Upper bound for a single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// CRUD capability offered by the collaboration framework
///
/// Tool handlers only see this trait, so tests can substitute an in-process
/// implementation for the HTTP client.
#[async_trait]
pub trait CollabApi: Send + Sync {
    /// List items of a collection
    async fn list(&self, resource: &Resource, query: &ListQuery) -> Result<Value, UpstreamError>;

    /// Fetch one item
    async fn get(&self, resource: &Resource, id: &str) -> Result<Value, UpstreamError>;

    /// Create an item and return it
    async fn create(&self, resource: &Resource, body: Value) -> Result<Value, UpstreamError>;

    /// Partially update an item and return it
    async fn update(&self, resource: &Resource, id: &str, body: Value) -> Result<Value, UpstreamError>;

    /// Delete an item
    async fn delete(&self, resource: &Resource, id: &str) -> Result<(), UpstreamError>;

    /// Backend status / version information
    async fn health(&self) -> Result<Value, UpstreamError>;
}

/// Retry schedule for transient upstream failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// reqwest-backed collaboration API client
pub struct HttpCollabClient {
    /// HTTP client
    http_client: reqwest::Client,

    /// API base URL without trailing slash
    base_url: String,

    /// Bearer token for the API
    token: Option<String>,

    /// Per-request timeout
    timeout: Duration,

    retry: RetryPolicy,
}

impl HttpCollabClient {
    /// Create a client from server configuration
    pub fn new(config: &Config) -> crate::error::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("pentest-mcp-server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.upstream_url.trim_end_matches('/').to_string(),
            token: config.upstream_token.clone(),
            timeout: config.upstream_timeout,
            retry: RetryPolicy {
                max_retries: config.upstream_retries,
                base_delay: config.upstream_backoff,
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/", self.base_url, path)
    }

    /// Send a request, retrying transient failures
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&'static str, String)],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), path, query, body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        method = %method,
                        path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying collaboration API request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&'static str, String)],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let url = self.url(path);
        debug!(method = %method, url = %url, "Calling collaboration API");

        let mut request = self
            .http_client
            .request(method, &url)
            .timeout(self.timeout)
            .query(query);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice(&bytes).map_err(|e| {
                UpstreamError::transport(format!("invalid JSON from collaboration API: {}", e), false)
            })
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(UpstreamError::from_status(status.as_u16(), &text))
        }
    }
}

#[async_trait]
impl CollabApi for HttpCollabClient {
    async fn list(&self, resource: &Resource, query: &ListQuery) -> Result<Value, UpstreamError> {
        self.send(Method::GET, &resource.path(), &query.to_pairs(), None)
            .await
    }

    async fn get(&self, resource: &Resource, id: &str) -> Result<Value, UpstreamError> {
        self.send(Method::GET, &resource.item_path(id), &[], None).await
    }

    async fn create(&self, resource: &Resource, body: Value) -> Result<Value, UpstreamError> {
        self.send(Method::POST, &resource.path(), &[], Some(&body))
            .await
    }

    async fn update(&self, resource: &Resource, id: &str, body: Value) -> Result<Value, UpstreamError> {
        self.send(Method::PATCH, &resource.item_path(id), &[], Some(&body))
            .await
    }

    async fn delete(&self, resource: &Resource, id: &str) -> Result<(), UpstreamError> {
        self.send(Method::DELETE, &resource.item_path(id), &[], None)
            .await
            .map(|_| ())
    }

    async fn health(&self) -> Result<Value, UpstreamError> {
        self.send(Method::GET, "utils/healthcheck", &[], None).await
    }
}
