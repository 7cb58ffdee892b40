//! Pooled HTTP transport.
//!
//! A single `reqwest::Client` keeps idle keep-alive connections for reuse. Because reqwest
//! opens a new socket whenever every pooled one is busy, a semaphore caps how many exchanges
//! run at once, so the number of simultaneous sockets stays bounded no matter how many logical
//! calls are waiting.

use crate::request::{Payload, RequestDescriptor};
use crate::{Error, Result};
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// A fully read HTTP response.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct PooledTransport {
    http_client: reqwest::Client,
    connections: Arc<Semaphore>,
}

impl PooledTransport {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::ConfigurationError(
                "Connection pool needs at least one connection".to_string(),
            ));
        }

        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(idle_timeout)
            .build()
            .map_err(|e| {
                Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http_client,
            connections: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Sends the request and reads the whole body while holding a connection slot.
    pub async fn send(&self, descriptor: &RequestDescriptor) -> Result<RawResponse> {
        let _permit = self
            .connections
            .acquire()
            .await
            .map_err(|_| Error::Shutdown)?;

        let mut request = self
            .http_client
            .request(descriptor.method.clone(), descriptor.url.clone())
            .headers(descriptor.headers.clone());

        match &descriptor.body {
            Some(Payload::Json(value)) => {
                request = request.json(value);
            }
            Some(Payload::Bytes { content_type, data }) => {
                if let Some(content_type) = content_type {
                    let value = HeaderValue::try_from(content_type.as_str()).map_err(|e| {
                        Error::ConfigurationError(format!("Invalid content type: {}", e))
                    })?;
                    request = request.header(CONTENT_TYPE, value);
                }
                request = request.body(data.clone());
            }
            None => {}
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    /// Fails every exchange still waiting for a slot.
    pub fn close(&self) {
        self.connections.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_pool() {
        assert!(matches!(
            PooledTransport::new(0, Duration::from_secs(30)),
            Err(Error::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_requests() {
        let transport = PooledTransport::new(2, Duration::from_secs(30)).unwrap();
        assert_eq!(transport.connections.available_permits(), 2);
        transport.close();

        let descriptor = RequestDescriptor {
            method: http::Method::GET,
            url: url::Url::parse("http://127.0.0.1:9/").unwrap(),
            headers: HeaderMap::new(),
            body: None,
        };
        assert!(matches!(
            transport.send(&descriptor).await,
            Err(Error::Shutdown)
        ));
    }
}
