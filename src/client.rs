//! The client façade.
//!
//! The [`Client`] type is the main entry point for calling the upstream API. Every call goes
//! through the same pipeline: cache lookup (GET), coalescing with identical in-flight GETs,
//! a rate limiter slot, then the retry loop over the pooled transport.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    cache::RequestCache,
    config::ClientConfig,
    dedup::RequestDeduplicator,
    rate_limit::RateLimiter,
    request::{RequestDescriptor, RequestOptions},
    response::Body,
    retry::{RetryEvent, RetryExecutor, RetryPredicate},
    stats::{CacheStats, Stats, StatsSnapshot},
    transport::{PooledTransport, RawResponse},
    Error, Response, Result,
};
use http::{HeaderName, HeaderValue, Method};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// A resilient client for one upstream API.
///
/// The client is cheap to clone; clones share the connection pool, cache, in-flight table,
/// rate limiter and statistics.
///
/// # Examples
///
/// ```no_run
/// use callguard::Client;
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct NewJob {
///     name: String,
/// }
///
/// #[derive(Deserialize)]
/// struct Job {
///     id: u64,
///     state: String,
/// }
///
/// # async fn example() -> Result<(), callguard::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/v1")?
///     .retries(3)
///     .retry_delay(Duration::from_millis(200))
///     .rate_limit(5, Duration::from_secs(1))
///     .build()?;
///
/// let created: callguard::Response<Job> = client
///     .post("/jobs", &NewJob { name: "nightly".to_string() })
///     .await?;
///
/// // Polling the same job is served from the cache within its TTL.
/// let job = client.get::<Job>(&format!("/jobs/{}", created.data.id)).await?;
/// println!("Job is {}", job.data.state);
///
/// println!("{:?}", client.stats());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    config: ClientConfig,
    transport: RwLock<Option<PooledTransport>>,
    cache: RequestCache<Response<Body>>,
    dedup: RequestDeduplicator<Result<Response<Body>>>,
    rate_limiter: RateLimiter,
    retry: RetryExecutor,
    stats: Stats,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use callguard::Client;
    ///
    /// # async fn example() -> Result<(), callguard::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Makes a request and returns the body parsed by content type.
    ///
    /// `endpoint` is either an absolute URL or a path relative to the base URL. GET responses
    /// are cached and concurrent identical GETs share one round trip; other methods always go
    /// upstream exactly once per call (plus retries).
    ///
    /// # Errors
    ///
    /// Returns the classified error of the last attempt. Errors are never replaced by a default
    /// value, and a failed call leaves nothing behind in the cache.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use callguard::{Body, Client, RequestOptions};
    /// use http::Method;
    ///
    /// # async fn example() -> Result<(), callguard::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let options = RequestOptions::new()
    ///     .with_query_param("state", "running")
    ///     .with_cache(false);
    /// let response = client.request(Method::GET, "/jobs", options).await?;
    /// if let Body::Json(jobs) = &response.data {
    ///     println!("{}", jobs);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Response<Body>> {
        self.inner.stats.record_request();

        let result = self.call(method, endpoint, options).await;
        if result.is_err() {
            self.inner.stats.record_error();
        }
        result
    }

    async fn call(
        &self,
        method: Method,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Response<Body>> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let descriptor = RequestDescriptor::new(
            method,
            &inner.base_url,
            endpoint,
            &inner.config.default_headers,
            &options,
        )?;
        let key = descriptor.canonical_key();
        let is_get = descriptor.method == Method::GET;
        let cacheable = is_get && inner.config.cache_enabled && options.cache.unwrap_or(true);

        if cacheable {
            if let Some(hit) = inner.cache.get(&key) {
                inner.stats.record_cache_hit();
                tracing::debug!(key = %key, "Cache hit");
                return Ok(hit.into_cached());
            }
            inner.stats.record_cache_miss();
        }

        let response = if is_get && inner.config.deduplication_enabled {
            let leader = Arc::clone(inner);
            let outcome = inner
                .dedup
                .deduplicate(&key, move || async move { leader.dispatch(&descriptor).await })
                .await;
            if outcome.joined {
                inner.stats.record_deduplicated();
            }
            outcome.value?
        } else {
            inner.dispatch(&descriptor).await?
        };

        if cacheable {
            let ttl = options.cache_ttl.unwrap_or(inner.config.cache_ttl);
            inner.cache.set(key, response.clone(), ttl);
        }

        Ok(response)
    }

    /// Makes a GET request and deserializes the body.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use callguard::Client;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Job { state: String }
    ///
    /// # async fn example() -> Result<(), callguard::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com")?
    ///     .build()?;
    ///
    /// let job: callguard::Response<Job> = client.get("/jobs/7").await?;
    /// println!("State: {}", job.data.state);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get<Res>(&self, path: &str) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.request_typed(Method::GET, path, RequestOptions::new())
            .await
    }

    /// Makes a POST request with a JSON body.
    pub async fn post<Req, Res>(&self, path: &str, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.send_json(Method::POST, path, body).await
    }

    /// Makes a PUT request with a JSON body.
    pub async fn put<Req, Res>(&self, path: &str, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.send_json(Method::PUT, path, body).await
    }

    /// Makes a PATCH request with a JSON body.
    pub async fn patch<Req, Res>(&self, path: &str, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.send_json(Method::PATCH, path, body).await
    }

    /// Makes a DELETE request.
    pub async fn delete<Res>(&self, path: &str) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.request_typed(Method::DELETE, path, RequestOptions::new())
            .await
    }

    async fn send_json<Req, Res>(
        &self,
        method: Method,
        path: &str,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let options = match RequestOptions::new().with_json(body) {
            Ok(options) => options,
            Err(e) => {
                self.inner.stats.record_request();
                self.inner.stats.record_error();
                return Err(e);
            }
        };
        self.request_typed(method, path, options).await
    }

    async fn request_typed<Res>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.request(method, path, options)
            .await?
            .deserialize()
            .inspect_err(|_| self.inner.stats.record_error())
    }

    /// Drops every cached response.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Cache occupancy and hit rate.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.stats.cache_stats(self.inner.cache.size())
    }

    /// A snapshot of this client's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.dedup.pending_count())
    }

    /// Zeroes every counter.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Releases the connection pool and clears cache and in-flight state.
    ///
    /// Calls made afterwards fail with [`Error::Shutdown`]. Attempts already on the wire run
    /// to completion; attempts still waiting for a connection fail. Idempotent.
    pub fn destroy(&self) {
        if let Some(transport) = self.inner.transport.write().take() {
            transport.close();
            tracing::debug!(base_url = %self.inner.base_url, "Client destroyed");
        }
        self.inner.cache.clear();
        self.inner.dedup.clear();
    }

    /// Returns `true` once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.transport.read().is_none()
    }
}

impl ClientInner {
    fn ensure_open(&self) -> Result<()> {
        self.transport().map(drop)
    }

    fn transport(&self) -> Result<PooledTransport> {
        self.transport.read().clone().ok_or(Error::Shutdown)
    }

    /// One logical round trip: a rate limiter slot, then the retry loop.
    async fn dispatch(&self, descriptor: &RequestDescriptor) -> Result<Response<Body>> {
        let start_time = Instant::now();
        self.rate_limiter.acquire().await;

        let attempted = self
            .retry
            .execute(
                |attempt| self.attempt(descriptor, attempt),
                |event| self.observe_failure(descriptor, event),
            )
            .await?;

        let mut response = attempted.value;
        response.latency = start_time.elapsed();
        response.attempts = attempted.attempts;
        Ok(response)
    }

    /// Executes a single request attempt.
    async fn attempt(
        &self,
        descriptor: &RequestDescriptor,
        attempt: usize,
    ) -> Result<Response<Body>> {
        let transport = self.transport()?;

        tracing::debug!(
            method = %descriptor.method,
            url = %descriptor.url,
            attempt = attempt,
            "Executing HTTP request"
        );

        let attempt_start = Instant::now();
        let raw = transport.send(descriptor).await?;
        parse_response(raw, attempt_start.elapsed(), attempt)
    }

    fn observe_failure(&self, descriptor: &RequestDescriptor, event: RetryEvent<'_>) {
        if event.error.is_timeout() {
            self.stats.record_timeout();
        }
        if event.delay.is_some() {
            self.stats.record_retry();
        }

        tracing::warn!(
            error = %event.error,
            attempt = event.attempt,
            method = %descriptor.method,
            url = %descriptor.url,
            will_retry = event.delay.is_some(),
            "Request failed"
        );
    }
}

/// Classifies and parses a fully read response.
fn parse_response(raw: RawResponse, latency: Duration, attempt: usize) -> Result<Response<Body>> {
    let RawResponse {
        status,
        headers,
        body,
    } = raw;

    tracing::info!(
        status = status.as_u16(),
        latency_ms = latency.as_millis(),
        attempt = attempt,
        "Received HTTP response"
    );

    if !status.is_success() {
        let raw_response = String::from_utf8_lossy(&body).into_owned();
        let error_body = serde_json::from_slice::<serde_json::Value>(&body).ok();

        if status.is_server_error() {
            tracing::warn!(
                status = status.as_u16(),
                response = %raw_response,
                "Server error (5xx)"
            );
        } else {
            tracing::error!(
                status = status.as_u16(),
                response = %raw_response,
                "Client error (4xx)"
            );
        }

        return Err(Error::from_status(status, raw_response, error_body, headers));
    }

    let data = Body::parse(status, &headers, body).inspect_err(|e| {
        tracing::error!(error = %e, status = status.as_u16(), "Failed to parse response");
    })?;

    Ok(Response::new(data, status, headers, latency, attempt))
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use callguard::ClientBuilder;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), callguard::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(10))
///     .retries(2)
///     .retry_delay(Duration::from_millis(100))
///     .max_retry_delay(Duration::from_millis(400))
///     .cache_ttl(Duration::from_secs(30))
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
    retry_predicate: Option<Box<dyn RetryPredicate>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            retry_predicate: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.config.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.config.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Bounds the total time of a call across all of its attempts.
    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.config.overall_timeout = Some(timeout);
        self
    }

    /// Sets how many times a retryable failure is retried.
    pub fn retries(mut self, retries: usize) -> Self {
        self.config.retries = retries;
        self
    }

    /// Sets the initial backoff delay.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Sets the backoff cap.
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    /// Randomizes backoff delays to spread out retries from many clients.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Sets whether a 429's `Retry-After` replaces the backoff delay.
    pub fn respect_retry_after(mut self, respect: bool) -> Self {
        self.config.respect_retry_after = respect;
        self
    }

    /// Caps the wait a `Retry-After` header may request.
    pub fn max_retry_after(mut self, max_wait: Duration) -> Self {
        self.config.max_retry_after = max_wait;
        self
    }

    /// Sets a custom retry predicate.
    ///
    /// By default, requests are retried based on `Error::is_retryable()`.
    pub fn retry_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Admits at most `max_requests` requests per `window`.
    pub fn rate_limit(mut self, max_requests: usize, window: Duration) -> Self {
        self.config.rate_limit = max_requests;
        self.config.rate_limit_window = window;
        self
    }

    /// Enables or disables the response cache.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache_enabled = enabled;
        self
    }

    /// Sets the default lifetime of cached responses.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Sets the maximum number of cached responses.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.config.cache_size = size;
        self
    }

    /// Enables or disables coalescing of concurrent identical GETs.
    pub fn deduplication_enabled(mut self, enabled: bool) -> Self {
        self.config.deduplication_enabled = enabled;
        self
    }

    /// Caps simultaneous connections to the upstream.
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    /// Sets how long idle pooled connections are kept.
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided, or a limit or timeout is zero.
    pub fn build(self) -> Result<Client> {
        let config = self.config;
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        if config.timeout.is_zero() {
            return Err(Error::ConfigurationError(
                "Timeout must be greater than zero".to_string(),
            ));
        }
        if config.overall_timeout.is_some_and(|overall| overall.is_zero()) {
            return Err(Error::ConfigurationError(
                "Overall timeout must be greater than zero".to_string(),
            ));
        }

        let transport = PooledTransport::new(config.max_connections, config.pool_idle_timeout)?;
        let rate_limiter = RateLimiter::new(config.rate_limit, config.rate_limit_window)?;
        let cache = RequestCache::new(config.cache_size)?;

        let mut retry = RetryExecutor::new(config.retry_policy())
            .with_attempt_timeout(config.timeout)
            .with_overall_timeout(config.overall_timeout);
        if let Some(predicate) = self.retry_predicate {
            retry = retry.with_predicate(predicate);
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                transport: RwLock::new(Some(transport)),
                cache,
                dedup: RequestDeduplicator::new(),
                rate_limiter,
                retry,
                stats: Stats::default(),
                config,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
