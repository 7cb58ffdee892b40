//! Response wrapper and content-type aware body parsing.
//!
//! The [`Response`] type wraps the parsed body along with metadata about the exchange
//! (status, headers, latency, attempts, whether it came from the cache).

use crate::{Error, Result};
use http::{header::CONTENT_TYPE, HeaderMap, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

/// A response body, parsed according to its `Content-Type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// `application/json` and `+json` media types.
    Json(serde_json::Value),
    /// `text/*`, XML and form media types, or an untyped body that is valid UTF-8.
    Text(String),
    /// Anything else.
    Bytes(Vec<u8>),
    /// No content.
    Empty,
}

impl Body {
    /// Parses a successful response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] when the body does not match its declared content type.
    pub(crate) fn parse(status: StatusCode, headers: &HeaderMap, bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Body::Empty);
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            });

        let parse_error = |bytes: &[u8], message: String| Error::Parse {
            status,
            raw_response: String::from_utf8_lossy(bytes).into_owned(),
            message,
        };

        match content_type.as_deref() {
            Some(mime) if is_json(mime) => serde_json::from_slice(&bytes)
                .map(Body::Json)
                .map_err(|e| parse_error(&bytes, e.to_string())),
            Some(mime) if is_text(mime) => String::from_utf8(bytes)
                .map(Body::Text)
                .map_err(|e| parse_error(e.as_bytes(), e.utf8_error().to_string())),
            Some(_) => Ok(Body::Bytes(bytes)),
            None => Ok(match String::from_utf8(bytes) {
                Ok(text) => Body::Text(text),
                Err(e) => Body::Bytes(e.into_bytes()),
            }),
        }
    }

    /// Returns the JSON value, if this is a JSON body.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the text, if this is a text body.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the raw bytes of any body.
    pub fn as_bytes(&self) -> std::borrow::Cow<'_, [u8]> {
        match self {
            Body::Json(value) => std::borrow::Cow::Owned(value.to_string().into_bytes()),
            Body::Text(text) => std::borrow::Cow::Borrowed(text.as_bytes()),
            Body::Bytes(bytes) => std::borrow::Cow::Borrowed(bytes),
            Body::Empty => std::borrow::Cow::Borrowed(&[]),
        }
    }

    /// Renders the body as text, replacing invalid UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.as_bytes()).into_owned()
    }

    /// Deserializes the body into `T`.
    ///
    /// Text bodies deserialize either as a plain string or as embedded JSON; an empty body
    /// deserializes like `null`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self {
            Body::Json(value) => Deserialize::deserialize(value),
            Body::Text(text) => {
                Deserialize::deserialize(serde_json::Value::String(text.clone()))
                    .or_else(|_| serde_json::from_str(text))
            }
            Body::Bytes(bytes) => serde_json::from_slice(bytes),
            Body::Empty => Deserialize::deserialize(serde_json::Value::Null),
        }
    }
}

fn is_json(mime: &str) -> bool {
    mime == "application/json" || mime.ends_with("+json")
}

fn is_text(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("+xml")
        || matches!(
            mime,
            "application/xml" | "application/javascript" | "application/x-www-form-urlencoded"
        )
}

/// A successful response.
///
/// # Type Parameters
///
/// * `T` - The type of the response data; [`Body`] for untyped calls
///
/// # Examples
///
/// ```no_run
/// use callguard::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Job {
///     id: u64,
///     state: String,
/// }
///
/// # async fn example() -> Result<(), callguard::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// let response = client.get::<Job>("/jobs/7").await?;
///
/// println!("Job {} is {}", response.data.id, response.data.state);
/// println!("Request took {:?} over {} attempt(s)", response.latency, response.attempts);
/// if response.from_cache {
///     println!("Served from cache");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The parsed response data.
    pub data: T,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// The total latency of the request, including all retry attempts.
    pub latency: Duration,

    /// The number of attempts made to complete this request.
    pub attempts: usize,

    /// `true` when the response was served from the cache without a network call.
    pub from_cache: bool,
}

impl<T> Response<T> {
    /// Creates a new `Response` for a network round trip.
    pub fn new(
        data: T,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            data,
            status,
            headers,
            latency,
            attempts,
            from_cache: false,
        }
    }

    /// Maps the response data to a different type using the provided function.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callguard::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response::new(
    ///     42,
    ///     StatusCode::OK,
    ///     HeaderMap::new(),
    ///     Duration::from_millis(100),
    ///     1,
    /// );
    ///
    /// let string_response = response.map(|n| n.to_string());
    /// assert_eq!(string_response.data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
            from_cache: self.from_cache,
        }
    }

    /// Returns `true` if the request required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    pub(crate) fn into_cached(mut self) -> Self {
        self.from_cache = true;
        self
    }
}

impl Response<Body> {
    /// Deserializes the body into `T`, keeping the response metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the body does not fit `T`.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<Response<T>> {
        match self.data.deserialize::<T>() {
            Ok(data) => Ok(Response {
                data,
                status: self.status,
                headers: self.headers,
                latency: self.latency,
                attempts: self.attempts,
                from_cache: self.from_cache,
            }),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    status = self.status.as_u16(),
                    "Failed to deserialize response"
                );
                Err(Error::Parse {
                    status: self.status,
                    raw_response: self.data.to_string_lossy(),
                    message: e.to_string(),
                })
            }
        }
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
