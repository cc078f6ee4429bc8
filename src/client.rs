//! Resilient HTTP client for hub services
//!
//! Wraps a pooled `reqwest` client with the two protection layers from
//! [`crate::resilience`]. The breaker sits outermost: an open circuit
//! rejects a call before a single retry attempt is spent, and one full
//! retry sequence books exactly one outcome with the breaker.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubcall::client::{ApiClient, ApiClientConfig};
//! use hubcall::resilience::CircuitBreakerRegistry;
//!
//! let registry = CircuitBreakerRegistry::new();
//! let client = ApiClient::new(
//!     ApiClientConfig::new("http://analytics.local:3000"),
//!     "analytics",
//!     &registry,
//! )?;
//! client.authenticate("secret-api-key").await?;
//! let response = client.get("/status").await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::error::{HubError, Result};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig, RetryPolicy,
};

/// Session key header installed by [`ApiClient::authenticate`]
const SESSION_KEY_HEADER: &str = "session-key";

/// Longest error-body excerpt carried in an `ApiConnection` error
const MAX_BODY_EXCERPT: usize = 500;

/// Client construction parameters.
///
/// The two `enable_*` flags toggle their protection layers independently;
/// both default to on.
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Idle connections kept per host
    pub pool_connections: usize,
    /// Hard cap on the connection pool
    pub pool_maxsize: usize,
    pub enable_circuit_breaker: bool,
    pub enable_retry: bool,
    pub default_headers: BTreeMap<String, String>,
}

impl ApiClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            pool_connections: 10,
            pool_maxsize: 10,
            enable_circuit_breaker: true,
            enable_retry: true,
            default_headers: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_pool(mut self, connections: usize, maxsize: usize) -> Self {
        self.pool_connections = connections;
        self.pool_maxsize = maxsize;
        self
    }

    pub fn with_circuit_breaker(mut self, enabled: bool) -> Self {
        self.enable_circuit_breaker = enabled;
        self
    }

    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }
}

/// Per-call overrides for a single request.
///
/// `timeout` replaces the client-wide timeout for this call only;
/// `query` pairs are appended to the URL.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// What was asked of the server
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
}

/// A completed HTTP exchange
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON body, or the raw text wrapped in a JSON string
    pub data: Value,
    pub headers: BTreeMap<String, String>,
    pub elapsed: Duration,
    pub request: RequestInfo,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "status_code": self.status,
            "data": self.data,
            "headers": self.headers,
            "elapsed_secs": self.elapsed.as_secs_f64(),
            "request": self.request,
        })
    }
}

#[derive(Debug, Default)]
struct ClientStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_elapsed_secs: f64,
}

/// Serializable view of per-attempt client counters
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_elapsed_secs: f64,
    pub avg_elapsed_secs: f64,
}

/// HTTP client with retry and circuit breaking
pub struct ApiClient {
    config: ApiClientConfig,
    service: String,
    http: reqwest::Client,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryPolicy>,
    /// Mutable so `authenticate` can install the session header
    default_headers: RwLock<BTreeMap<String, String>>,
    stats: Mutex<ClientStats>,
}

impl ApiClient {
    /// Build a client for `service`, drawing its breaker from `registry`
    /// with default breaker settings.
    pub fn new(
        config: ApiClientConfig,
        service: impl Into<String>,
        registry: &CircuitBreakerRegistry,
    ) -> Result<Self> {
        Self::with_breaker_config(config, service, registry, CircuitBreakerConfig::default())
    }

    /// Build a client whose breaker, if newly created, uses
    /// `breaker_config` (typically a per-service preset).
    pub fn with_breaker_config(
        config: ApiClientConfig,
        service: impl Into<String>,
        registry: &CircuitBreakerRegistry,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self> {
        let service = service.into();

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_connections.min(config.pool_maxsize))
            .build()
            .map_err(|e| {
                HubError::configuration(
                    format!("failed to build HTTP client: {e}"),
                    "",
                    "client",
                )
            })?;

        let breaker = config
            .enable_circuit_breaker
            .then(|| registry.get_or_create(&service, breaker_config));
        let retry = config.enable_retry.then(|| {
            RetryPolicy::new(RetryConfig::default().with_max_retries(config.max_retries))
        });

        Ok(Self {
            default_headers: RwLock::new(config.default_headers.clone()),
            config,
            service,
            http,
            breaker,
            retry,
            stats: Mutex::new(ClientStats::default()),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &ApiClientConfig {
        &self.config
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::GET, path, None, RequestOptions::new())
            .await
    }

    pub async fn get_with(&self, path: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(Method::GET, path, None, options).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.request(Method::POST, path, Some(body.clone()), RequestOptions::new())
            .await
    }

    pub async fn post_with(
        &self,
        path: &str,
        body: &Value,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.request(Method::POST, path, Some(body.clone()), options)
            .await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        self.request(Method::PUT, path, Some(body.clone()), RequestOptions::new())
            .await
    }

    pub async fn put_with(
        &self,
        path: &str,
        body: &Value,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.request(Method::PUT, path, Some(body.clone()), options)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(Method::DELETE, path, None, RequestOptions::new())
            .await
    }

    pub async fn delete_with(&self, path: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(Method::DELETE, path, None, options).await
    }

    /// Run one request through whichever protection layers are enabled
    #[instrument(skip(self, body, options), fields(service = %self.service))]
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let url = self.resolve_url(path);
        let operation = format!("{method} {path}");

        match (&self.breaker, &self.retry) {
            (Some(breaker), Some(retry)) => {
                breaker
                    .execute(|| {
                        retry.execute(&operation, || {
                            self.send_once(method.clone(), &url, body.as_ref(), &options)
                        })
                    })
                    .await
            }
            (Some(breaker), None) => {
                breaker
                    .execute(|| self.send_once(method.clone(), &url, body.as_ref(), &options))
                    .await
            }
            (None, Some(retry)) => {
                retry
                    .execute(&operation, || {
                        self.send_once(method.clone(), &url, body.as_ref(), &options)
                    })
                    .await
            }
            (None, None) => self.send_once(method, &url, body.as_ref(), &options).await,
        }
    }

    /// One physical attempt. Updates client stats whatever the outcome.
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        options: &RequestOptions,
    ) -> Result<ApiResponse> {
        let headers = self.default_headers.read().clone();
        let mut request = self.http.request(method.clone(), url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let outcome = request.send().await;
        let elapsed = started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.record_attempt(false, elapsed);
                let effective_timeout = options.timeout.unwrap_or(self.config.timeout);
                let message = if err.is_timeout() {
                    format!(
                        "request to {url} timed out after {:.1}s",
                        effective_timeout.as_secs_f64()
                    )
                } else if err.is_connect() {
                    format!("connection to {url} failed: {err}")
                } else {
                    format!("request to {url} failed: {err}")
                };
                let timeout = err.is_timeout().then(|| effective_timeout.as_secs_f64());
                return Err(HubError::api_connection(message, url, None, "", timeout));
            }
        };

        let status = response.status();
        let response_headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                self.record_attempt(false, elapsed);
                return Err(HubError::api_connection(
                    format!("failed to read response body from {url}: {err}"),
                    url,
                    Some(status.as_u16()),
                    "",
                    None,
                ));
            }
        };

        if !status.is_success() {
            self.record_attempt(false, elapsed);
            warn!(status = status.as_u16(), %url, "request failed");
            return Err(HubError::api_connection(
                format!("HTTP {} from {} {}", status.as_u16(), method, url),
                url,
                Some(status.as_u16()),
                truncate_body(&text, MAX_BODY_EXCERPT),
                None,
            ));
        }

        self.record_attempt(true, elapsed);
        debug!(status = status.as_u16(), %url, elapsed_ms = elapsed.as_millis() as u64, "request ok");

        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(ApiResponse {
            status: status.as_u16(),
            data,
            headers: response_headers,
            elapsed,
            request: RequestInfo {
                method: method.to_string(),
                url: url.to_string(),
            },
        })
    }

    /// Exchange a long-lived API key for a session key and install it as
    /// the default `session-key` header for this instance.
    pub async fn authenticate(&self, api_key: &str) -> Result<()> {
        let credential_supplied = !api_key.is_empty();
        let payload = json!({ "apiKey": api_key });

        let response = self
            .request(Method::POST, "/auth/login", Some(payload), RequestOptions::new())
            .await
            .map_err(|err| {
                HubError::authentication(
                    format!("login failed: {err}"),
                    "api_key",
                    credential_supplied,
                    false,
                )
            })?;

        let session_key = response
            .data
            .get("sessionKey")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HubError::authentication(
                    "login response did not carry a session key",
                    "api_key",
                    credential_supplied,
                    false,
                )
            })?;

        self.default_headers
            .write()
            .insert(SESSION_KEY_HEADER.to_string(), session_key.to_string());
        debug!(service = %self.service, "session key installed");
        Ok(())
    }

    fn record_attempt(&self, success: bool, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }
        stats.total_elapsed_secs += elapsed.as_secs_f64();
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        let stats = self.stats.lock();
        let avg = if stats.total_requests == 0 {
            0.0
        } else {
            stats.total_elapsed_secs / stats.total_requests as f64
        };
        ClientStatsSnapshot {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            total_elapsed_secs: stats.total_elapsed_secs,
            avg_elapsed_secs: avg,
        }
    }

    /// Merged health document: client stats, breaker status, retry stats
    pub fn health_status(&self) -> Value {
        json!({
            "service": self.service,
            "base_url": self.config.base_url,
            "client": self.stats(),
            "circuit_breaker": self.breaker.as_ref().map(|b| b.status()),
            "retry": self.retry.as_ref().map(|r| r.stats()),
        })
    }

    /// Reset the breaker and retry statistics, e.g. after maintenance
    pub fn reset_protection(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
        if let Some(retry) = &self.retry {
            retry.reset_stats();
        }
    }

    fn resolve_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("service", &self.service)
            .field("base_url", &self.config.base_url)
            .field("circuit_breaker", &self.breaker.is_some())
            .field("retry", &self.retry.is_some())
            .finish()
    }
}

fn truncate_body(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}
