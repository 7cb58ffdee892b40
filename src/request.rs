//! Per-call request options and the resolved request descriptor.
//!
//! [`RequestOptions`] is what callers hand to [`Client::request`](crate::Client::request).
//! The client resolves it against its base URL and default headers into an immutable
//! [`RequestDescriptor`], whose [`canonical_key`](RequestDescriptor::canonical_key) joins the
//! cache, the deduplicator and the logs.

use crate::{Error, Result};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

/// A request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A structured value, sent as `application/json`.
    Json(serde_json::Value),
    /// Opaque bytes with an optional content type.
    Bytes {
        /// Sent as the `Content-Type` header when set
        content_type: Option<String>,
        /// The raw body
        data: Vec<u8>,
    },
}

impl Payload {
    /// Serializes `value` into a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SerializationFailed`] if `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|e| Error::SerializationFailed(e.to_string()))
    }

    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            // serde_json maps keep their keys sorted, so equal values serialize identically.
            Payload::Json(value) => {
                hasher.update(b"json:");
                hasher.update(value.to_string().as_bytes());
            }
            Payload::Bytes { content_type, data } => {
                hasher.update(b"bytes:");
                hasher.update(content_type.as_deref().unwrap_or_default().as_bytes());
                hasher.update(b":");
                hasher.update(data);
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Options for a single call.
///
/// # Examples
///
/// ```
/// use callguard::RequestOptions;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), callguard::Error> {
/// let options = RequestOptions::new()
///     .with_header("X-Trace-Id", "abc123")?
///     .with_query_param("page", "2")
///     .with_cache_ttl(Duration::from_secs(5));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Headers for this call, layered over the client's default headers.
    pub headers: HeaderMap,

    /// Query parameters appended to the URL.
    pub query_params: Vec<(String, String)>,

    /// The request body.
    pub body: Option<Payload>,

    /// Whether this call may read and populate the cache. `None` means yes for GET.
    pub cache: Option<bool>,

    /// Overrides the client's cache TTL for the stored response.
    pub cache_ttl: Option<Duration>,
}

impl RequestOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    /// Sets a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if `body` cannot be serialized.
    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(Payload::json(body)?);
        Ok(self)
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Payload) -> Self {
        self.body = Some(body);
        self
    }

    /// Enables or disables caching for this call.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = Some(enabled);
        self
    }

    /// Overrides the TTL of the cached response.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// A fully resolved request. Immutable once built.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// The HTTP method.
    pub method: Method,
    /// The absolute URL, query included.
    pub url: Url,
    /// Default headers merged with per-call headers.
    pub headers: HeaderMap,
    /// The request body.
    pub body: Option<Payload>,
}

impl RequestDescriptor {
    /// Resolves `endpoint` against `base_url` and merges headers.
    ///
    /// Per-call headers replace default headers of the same name.
    pub fn new(
        method: Method,
        base_url: &Url,
        endpoint: &str,
        default_headers: &HeaderMap,
        options: &RequestOptions,
    ) -> Result<Self> {
        let mut url = resolve_url(base_url, endpoint)?;
        if !options.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &options.query_params {
                pairs.append_pair(key, value);
            }
        }

        let mut headers = default_headers.clone();
        for name in options.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &options.headers {
            headers.append(name.clone(), value.clone());
        }

        Ok(Self {
            method,
            url,
            headers,
            body: options.body.clone(),
        })
    }

    /// Deterministic identity of this request.
    ///
    /// Built from the method, the URL with its query pairs sorted, every header sorted by name
    /// and a SHA-256 digest of the body. Header names are case-insensitive.
    pub fn canonical_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(&pairs);
        }

        let mut headers: Vec<(&str, String)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        headers.sort();
        let headers = headers
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(";");

        let body = self
            .body
            .as_ref()
            .map(Payload::digest)
            .unwrap_or_default();

        format!("{} {} [{}] #{}", self.method, url, headers, body)
    }
}

/// Resolves an endpoint against the base URL.
///
/// Absolute `http(s)` URLs are used as-is. Anything else is appended to the base URL's path,
/// so a base of `https://api.example.com/v1` and an endpoint of `/users` yields
/// `https://api.example.com/v1/users`.
pub fn resolve_url(base_url: &Url, endpoint: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(endpoint) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(url);
        }
    }

    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint, None),
    };

    let mut url = base_url.clone();
    let joined = format!(
        "{}/{}",
        base_url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query.filter(|q| !q.is_empty()));
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://api.example.com/v1/").unwrap()
    }

    fn describe(method: Method, endpoint: &str, options: RequestOptions) -> RequestDescriptor {
        RequestDescriptor::new(method, &base(), endpoint, &HeaderMap::new(), &options).unwrap()
    }

    #[test]
    fn test_resolves_relative_and_absolute_endpoints() {
        assert_eq!(
            resolve_url(&base(), "/users/1").unwrap().as_str(),
            "https://api.example.com/v1/users/1"
        );
        assert_eq!(
            resolve_url(&base(), "users?active=true").unwrap().as_str(),
            "https://api.example.com/v1/users?active=true"
        );
        assert_eq!(
            resolve_url(&base(), "https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_key_ignores_query_order_and_header_case() {
        let a = describe(
            Method::GET,
            "/items?b=2&a=1",
            RequestOptions::new().with_header("X-Tenant", "acme").unwrap(),
        );
        let b = describe(
            Method::GET,
            "/items",
            RequestOptions::new()
                .with_query_param("a", "1")
                .with_query_param("b", "2")
                .with_header("x-tenant", "acme")
                .unwrap(),
        );
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn test_key_distinguishes_method_headers_and_body() {
        let get = describe(Method::GET, "/items", RequestOptions::new());
        let delete = describe(Method::DELETE, "/items", RequestOptions::new());
        assert_ne!(get.canonical_key(), delete.canonical_key());

        let tenant_a = describe(
            Method::GET,
            "/items",
            RequestOptions::new().with_header("x-tenant", "a").unwrap(),
        );
        assert_ne!(get.canonical_key(), tenant_a.canonical_key());

        let body_1 = describe(
            Method::POST,
            "/items",
            RequestOptions::new()
                .with_json(&serde_json::json!({"n": 1}))
                .unwrap(),
        );
        let body_2 = describe(
            Method::POST,
            "/items",
            RequestOptions::new()
                .with_json(&serde_json::json!({"n": 2}))
                .unwrap(),
        );
        assert_ne!(body_1.canonical_key(), body_2.canonical_key());
    }

    #[test]
    fn test_json_body_key_independent_of_field_order() {
        let a = describe(
            Method::POST,
            "/items",
            RequestOptions::new()
                .with_body(Payload::Json(
                    serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap(),
                )),
        );
        let b = describe(
            Method::POST,
            "/items",
            RequestOptions::new()
                .with_body(Payload::Json(
                    serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap(),
                )),
        );
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn test_per_call_headers_override_defaults() {
        let mut defaults = HeaderMap::new();
        defaults.insert("accept", HeaderValue::from_static("text/plain"));

        let descriptor = RequestDescriptor::new(
            Method::GET,
            &base(),
            "/items",
            &defaults,
            &RequestOptions::new()
                .with_header("Accept", "application/json")
                .unwrap(),
        )
        .unwrap();

        assert_eq!(descriptor.headers.get("accept").unwrap(), "application/json");
        assert_eq!(descriptor.headers.len(), 1);
    }

    #[test]
    fn test_multi_valued_per_call_header_keeps_every_value() {
        let mut defaults = HeaderMap::new();
        defaults.insert("x-tag", HeaderValue::from_static("default"));

        let mut options = RequestOptions::new();
        options.headers.append("x-tag", HeaderValue::from_static("a"));
        options.headers.append("x-tag", HeaderValue::from_static("b"));

        let descriptor =
            RequestDescriptor::new(Method::GET, &base(), "/items", &defaults, &options).unwrap();

        let values: Vec<_> = descriptor.headers.get_all("x-tag").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
