//! Error types for upstream API calls.
//!
//! Every failure a caller can observe is one of the variants of [`Error`]. HTTP failures keep
//! the status code, the raw body, the parsed JSON error body (when the upstream sent JSON) and
//! the response headers, so callers have enough detail to decide what to do next.
//!
//! Errors are `Clone`: when concurrent identical GETs are coalesced, every caller receives the
//! same error value produced by the single underlying attempt.

use crate::rate_limit::RateLimitInfo;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// The main error type for API calls.
///
/// # Examples
///
/// ```no_run
/// use callguard::{Client, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get::<serde_json::Value>("/jobs/42").await {
///     Ok(response) => println!("Job: {:?}", response.data),
///     Err(Error::ClientError { status, body, .. }) => {
///         eprintln!("Rejected with {}: {:?}", status, body);
///     }
///     Err(e) if e.is_retryable() => eprintln!("Upstream still failing: {}", e),
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// An attempt exceeded its deadline.
    ///
    /// Raised when a single attempt outlives the per-attempt timeout, or when the overall
    /// deadline of a call runs out.
    #[error("Request timed out")]
    Timeout,

    /// A connection-level failure (DNS lookup, connection refused, reset, TLS).
    ///
    /// The underlying `reqwest::Error` sits behind an `Arc` so the error can be shared.
    #[error("Transport error: {0}")]
    Transport(Arc<reqwest::Error>),

    /// The upstream answered with a 4xx status other than 429. Never retried.
    #[error("Client error {status}: {raw_response}")]
    ClientError {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        raw_response: String,
        /// The error body, when the upstream sent parseable JSON
        body: Option<serde_json::Value>,
        /// The response headers
        headers: HeaderMap,
    },

    /// The upstream answered with 429 Too Many Requests. Retryable.
    #[error("Rate limited by upstream: {raw_response}")]
    RateLimited {
        /// The raw response body
        raw_response: String,
        /// The error body, when the upstream sent parseable JSON
        body: Option<serde_json::Value>,
        /// The response headers
        headers: HeaderMap,
        /// Wait hints parsed from `Retry-After` and related headers
        rate_limit_info: Option<RateLimitInfo>,
    },

    /// The upstream answered with a 5xx status. Retryable.
    #[error("Server error {status}: {raw_response}")]
    ServerError {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        raw_response: String,
        /// The error body, when the upstream sent parseable JSON
        body: Option<serde_json::Value>,
        /// The response headers
        headers: HeaderMap,
    },

    /// The response body could not be parsed.
    ///
    /// Retryable only when `status` itself is a retryable status; a malformed body on a 2xx
    /// response fails immediately.
    #[error("Failed to parse response (status {status}): {message}")]
    Parse {
        /// The HTTP status code of the response
        status: StatusCode,
        /// The raw response body, lossily decoded
        raw_response: String,
        /// What went wrong
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The client was destroyed and no longer owns a transport.
    #[error("Client has been shut down")]
    Shutdown,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(Arc::new(err))
        }
    }
}

impl Error {
    /// Classifies an unsuccessful HTTP response.
    pub(crate) fn from_status(
        status: StatusCode,
        raw_response: String,
        body: Option<serde_json::Value>,
        headers: HeaderMap,
    ) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            let info = RateLimitInfo::from_headers(&headers);
            Error::RateLimited {
                raw_response,
                body,
                rate_limit_info: info.is_rate_limited().then_some(info),
                headers,
            }
        } else if status.is_server_error() {
            Error::ServerError {
                status,
                raw_response,
                body,
                headers,
            }
        } else {
            // Anything else outside 2xx that reached here (4xx, stray 3xx/1xx) is not worth
            // repeating.
            Error::ClientError {
                status,
                raw_response,
                body,
                headers,
            }
        }
    }

    /// Returns `true` if this error is worth another attempt.
    ///
    /// Timeouts, transport failures, 429 and 5xx responses are retryable. Client errors,
    /// parse failures on non-retryable statuses and local errors are not.
    ///
    /// # Examples
    ///
    /// ```
    /// use callguard::Error;
    /// use http::{HeaderMap, StatusCode};
    ///
    /// let err = Error::ServerError {
    ///     status: StatusCode::BAD_GATEWAY,
    ///     raw_response: "upstream down".to_string(),
    ///     body: None,
    ///     headers: HeaderMap::new(),
    /// };
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::ClientError {
    ///     status: StatusCode::NOT_FOUND,
    ///     raw_response: "missing".to_string(),
    ///     body: None,
    ///     headers: HeaderMap::new(),
    /// };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Transport(_) => true,
            Error::RateLimited { .. } => true,
            Error::ServerError { .. } => true,
            Error::Parse { status, .. } => is_retryable_status(*status),
            Error::ClientError { .. } => false,
            Error::ConfigurationError(_) => false,
            Error::SerializationFailed(_) => false,
            Error::InvalidUrl(_) => false,
            Error::Shutdown => false,
        }
    }

    /// Returns `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Returns the HTTP status code if the error came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::ClientError { status, .. } => Some(*status),
            Error::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            Error::ServerError { status, .. } => Some(*status),
            Error::Parse { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if the error came from a response.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::ClientError { raw_response, .. }
            | Error::RateLimited { raw_response, .. }
            | Error::ServerError { raw_response, .. }
            | Error::Parse { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the parsed JSON error body, if the upstream sent one.
    pub fn error_body(&self) -> Option<&serde_json::Value> {
        match self {
            Error::ClientError { body, .. }
            | Error::RateLimited { body, .. }
            | Error::ServerError { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    /// Returns rate limit information parsed from a 429 response.
    pub fn rate_limit_info(&self) -> Option<&RateLimitInfo> {
        match self {
            Error::RateLimited {
                rate_limit_info, ..
            } => rate_limit_info.as_ref(),
            _ => None,
        }
    }

    /// Returns the upstream-requested wait before retrying, capped by `max_wait`.
    pub fn rate_limit_delay(&self, max_wait: std::time::Duration) -> Option<std::time::Duration> {
        self.rate_limit_info()?.delay(max_wait)
    }
}

/// 429 and 5xx are the statuses an upstream uses to say "try again later".
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// A specialized `Result` type for API calls.
pub type Result<T> = std::result::Result<T, Error>;
