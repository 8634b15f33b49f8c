use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use zre_core::EndpointDescriptor;

/// Per-request retry budget. Waits double from `base_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (zero-based).
    pub fn wait_before(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.rentcast.io/v1".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("expected a JSON array of listings from {url}, got {found}")]
    UnexpectedShape { url: String, found: &'static str },
}

impl FetchError {
    /// Worth asking again: timeouts, refused connections, throttling and 5xx.
    /// A body that decodes wrong or a 4xx will not improve on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::UnexpectedShape { .. } => false,
        }
    }
}

/// Anything that can answer one listings query.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listings(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Debug)]
pub struct HttpListingSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl HttpListingSource {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    pub fn endpoint_url(&self, endpoint: &EndpointDescriptor) -> String {
        format!("{}{}", self.base_url, endpoint.category.api_path())
    }

    async fn fetch_once(
        &self,
        url: &str,
        endpoint: &EndpointDescriptor,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let resp = self
            .client
            .get(url)
            .header("accept", "application/json")
            .header("X-Api-Key", &self.api_key)
            .query(&endpoint.query_params())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        match resp.json::<JsonValue>().await? {
            JsonValue::Array(items) => Ok(items),
            other => Err(FetchError::UnexpectedShape {
                url: url.to_string(),
                found: json_kind(&other),
            }),
        }
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_listings(
        &self,
        endpoint: &EndpointDescriptor,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let url = self.endpoint_url(endpoint);
        let span = info_span!(
            "http_fetch",
            url = %url,
            category = %endpoint.category,
            region = %endpoint.region
        );

        async {
            let mut retries = 0;
            loop {
                match self.fetch_once(&url, endpoint).await {
                    Err(err) if err.is_transient() && retries < self.backoff.max_retries => {
                        let wait = self.backoff.wait_before(retries);
                        warn!(retry = retries + 1, ?wait, error = %err, "listings request failed; asking again");
                        tokio::time::sleep(wait).await;
                        retries += 1;
                    }
                    done => return done,
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
