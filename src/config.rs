//! Client configuration.

use crate::retry::RetryPolicy;
use http::HeaderMap;
use std::time::Duration;
use url::Url;

/// Every tunable of a [`Client`](crate::Client), with defaults.
///
/// Usually filled in through [`ClientBuilder`](crate::ClientBuilder); build one directly when
/// the settings come from elsewhere and hand it to
/// [`ClientBuilder::config`](crate::ClientBuilder::config).
///
/// # Examples
///
/// ```
/// use callguard::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     retries: 2,
///     retry_delay: Duration::from_millis(100),
///     max_retry_delay: Duration::from_millis(400),
///     ..ClientConfig::default()
/// };
/// assert!(config.cache_enabled);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL that relative endpoints are resolved against. Required.
    pub base_url: Option<Url>,

    /// Headers sent with every request.
    pub default_headers: HeaderMap,

    /// Per-attempt timeout.
    pub timeout: Duration,

    /// Bound on total time across all attempts of one call.
    pub overall_timeout: Option<Duration>,

    /// Retries after the first attempt.
    pub retries: usize,

    /// Initial backoff delay.
    pub retry_delay: Duration,

    /// Backoff cap.
    pub max_retry_delay: Duration,

    /// Randomize backoff delays.
    pub jitter: bool,

    /// Honor `Retry-After` and rate-limit reset headers on 429 responses.
    pub respect_retry_after: bool,

    /// Upper bound on a header-requested wait.
    pub max_retry_after: Duration,

    /// Requests admitted per `rate_limit_window`.
    pub rate_limit: usize,

    /// Length of the rate limiting window.
    pub rate_limit_window: Duration,

    /// Cache successful GET responses.
    pub cache_enabled: bool,

    /// Default lifetime of a cached response.
    pub cache_ttl: Duration,

    /// Maximum number of cached responses.
    pub cache_size: usize,

    /// Coalesce concurrent identical GETs.
    pub deduplication_enabled: bool,

    /// Maximum simultaneous connections.
    pub max_connections: usize,

    /// How long an idle pooled connection is kept.
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            timeout: Duration::from_secs(30),
            overall_timeout: None,
            retries: retry.max_retries,
            retry_delay: retry.initial_delay,
            max_retry_delay: retry.max_delay,
            jitter: retry.jitter,
            respect_retry_after: retry.respect_retry_after,
            max_retry_after: retry.max_retry_after,
            rate_limit: 10,
            rate_limit_window: Duration::from_secs(1),
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            cache_size: 100,
            deduplication_enabled: true,
            max_connections: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// The retry policy described by this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retries,
            initial_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
            jitter: self.jitter,
            respect_retry_after: self.respect_retry_after,
            max_retry_after: self.max_retry_after,
        }
    }
}
