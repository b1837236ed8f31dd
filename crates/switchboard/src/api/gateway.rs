//! Rate-limited, retrying HTTP gateway to the remote business API.
//!
//! Every outbound API call goes through [`RetryingHttpGateway::call`]:
//!
//! 1. the URL is built from the base URL, the endpoint and the query
//!    parameters, with the configured credentials merged in last;
//! 2. one unit of quota is taken from the shared [`RateLimiter`], failing
//!    fast when the window is exhausted;
//! 3. each attempt runs under the per-call timeout, and transient failures
//!    are retried per [`RetryPolicy`](crate::config::RetryPolicy);
//! 4. a successful JSON body is returned as a [`serde_json::Value`].
//!
//! Request URLs carry credentials, so only endpoint names are ever logged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::Url;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::rate_limit::RateLimiter;
use super::retry::{parse_retry_after, retry_with_backoff};
use crate::config::{GatewayConfig, RetryPolicy};
use crate::error::{ConfigError, GatewayError, TransportError};

/// Caller query parameters. Ordered, so built URLs are deterministic.
pub type QueryParams = BTreeMap<String, String>;

/// Upstream error bodies are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Raw response as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Value of the `Retry-After` header, if any.
    pub retry_after: Option<String>,
    pub body: String,
}

/// Performs one GET. Implementations must not apply their own retries.
pub trait HttpTransport: Send + Sync {
    fn get<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

// ── Transport ──────────────────────────────────────────────────────

/// [`HttpTransport`] backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build the client. Timeouts are applied per attempt by the gateway.
    pub fn new(user_agent: &str) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            // `without_url` keeps credential query parameters out of errors.
            let resp = self
                .client
                .get(url.clone())
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| TransportError(format!("request failed: {}", e.without_url())))?;

            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.map_err(|e| {
                TransportError(format!("failed to read response: {}", e.without_url()))
            })?;

            Ok(HttpResponse {
                status,
                retry_after,
                body,
            })
        })
    }
}

// ── Gateway ────────────────────────────────────────────────────────

/// The sole path to the remote business API.
///
/// Share one instance (behind an `Arc`) across all callers so they share one
/// quota window.
pub struct RetryingHttpGateway {
    base_url: Url,
    credentials: Vec<(String, String)>,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for RetryingHttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.credentials.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("RetryingHttpGateway")
            .field("base_url", &self.base_url.as_str())
            .field("credentials", &names)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RetryingHttpGateway {
    /// Gateway over a real HTTP client.
    pub fn new(config: GatewayConfig) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(&config.user_agent)?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: GatewayConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // A trailing slash makes endpoint joins append instead of replace.
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).map_err(|e| ConfigError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: config.base_url,
                reason: "expected an http(s) URL".into(),
            });
        }

        Ok(Self {
            base_url,
            credentials: config.credentials,
            timeout: config.timeout,
            retry: config.retry,
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            transport,
        })
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Full request URL for `endpoint`. Credentials override caller
    /// parameters of the same name.
    pub fn build_url(&self, endpoint: &str, params: &QueryParams) -> Result<Url, GatewayError> {
        let invalid = |reason: String| GatewayError::InvalidUrl {
            endpoint: endpoint.to_string(),
            reason,
        };

        let path = endpoint.trim().trim_start_matches('/');
        if path.is_empty() {
            return Err(invalid("endpoint is empty".into()));
        }
        let mut url = self.base_url.join(path).map_err(|e| invalid(e.to_string()))?;
        if url.origin() != self.base_url.origin() {
            return Err(invalid("endpoint must be relative to the base URL".into()));
        }

        let mut query = params.clone();
        for (name, value) in &self.credentials {
            query.insert(name.clone(), value.clone());
        }
        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    /// Call `endpoint` with `params` and return the parsed JSON body.
    ///
    /// Takes one unit of quota per call regardless of retries. Terminal
    /// upstream failures are returned immediately; transient ones only after
    /// the retry budget is spent.
    pub async fn call(&self, endpoint: &str, params: &QueryParams) -> Result<Value, GatewayError> {
        let url = self.build_url(endpoint, params)?;

        if let Err(wait) = self.limiter.try_acquire() {
            warn!("Rate limit reached; rejecting call to {endpoint} (resets in {wait:?})");
            return Err(GatewayError::RateLimited {
                endpoint: endpoint.to_string(),
                retry_after: wait,
            });
        }

        debug!(
            "Gateway request: endpoint={endpoint}, params={}",
            params.keys().cloned().collect::<Vec<_>>().join(",")
        );
        let start = Instant::now();
        let url = &url;

        let (value, attempts) = retry_with_backoff(&self.retry, endpoint, move |attempt| {
            self.attempt(endpoint, url, attempt)
        })
        .await?;

        if attempts > 1 && !self.retry.pacing_delay.is_zero() {
            trace!("Pacing {:?} after retried call", self.retry.pacing_delay);
            tokio::time::sleep(self.retry.pacing_delay).await;
        }
        debug!(
            "Gateway {endpoint} succeeded after {attempts} attempt(s) in {:.1}s",
            start.elapsed().as_secs_f64()
        );
        Ok(value)
    }

    async fn attempt(&self, endpoint: &str, url: &Url, attempt: u32) -> Result<Value, GatewayError> {
        let start = Instant::now();
        let response = match tokio::time::timeout(self.timeout, self.transport.get(url)).await {
            Err(_) => {
                return Err(GatewayError::Timeout {
                    endpoint: endpoint.to_string(),
                    timeout: self.timeout,
                    attempt,
                });
            }
            Ok(Err(source)) => {
                return Err(GatewayError::Network {
                    endpoint: endpoint.to_string(),
                    attempt,
                    source,
                });
            }
            Ok(Ok(response)) => response,
        };

        debug!(
            "Gateway response: {endpoint} HTTP {} in {:.1}s ({} bytes)",
            response.status,
            start.elapsed().as_secs_f64(),
            response.body.len()
        );

        if !(200..300).contains(&response.status) {
            let retry_after = response
                .retry_after
                .as_deref()
                .and_then(|v| parse_retry_after(v, Utc::now()));
            return Err(GatewayError::Upstream {
                endpoint: endpoint.to_string(),
                status: response.status,
                attempt,
                body: response.body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                retry_after,
            });
        }

        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&response.body).map_err(|source| GatewayError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}
