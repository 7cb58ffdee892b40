//! # Callguard - A resilient client for rate-limited upstream APIs
//!
//! Callguard mediates every outbound call to a REST service that is rate limited,
//! occasionally slow and occasionally failing. It is built on top of `reqwest` and coordinates:
//!
//! - **Caching** - successful GET responses are kept in a bounded LRU cache with a TTL
//! - **Request coalescing** - concurrent identical GETs share a single round trip
//! - **Rate limiting** - a sliding window caps how many requests leave per time window
//! - **Retries** - timeouts, connection failures, 429 and 5xx are retried with exponential
//!   backoff; other 4xx fail immediately
//! - **Connection pooling** - one shared pool with a hard cap on simultaneous connections
//! - **Statistics** - per-client counters for requests, cache hits, retries and errors
//!
//! ## Quick Start
//!
//! ```no_run
//! use callguard::Client;
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Status {
//!     healthy: bool,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), callguard::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .timeout(Duration::from_secs(10))
//!         .retries(3)
//!         .retry_delay(Duration::from_millis(100))
//!         .max_retry_delay(Duration::from_secs(5))
//!         .rate_limit(10, Duration::from_secs(1))
//!         .cache_ttl(Duration::from_secs(30))
//!         .build()?;
//!
//!     let status = client.get::<Status>("/status").await?;
//!     println!("Healthy: {} ({:?})", status.data.healthy, status.latency);
//!
//!     // Served from the cache.
//!     let again = client.get::<Status>("/status").await?;
//!     assert!(again.from_cache);
//!
//!     println!("{:?}", client.stats());
//!     client.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Failures surface as a classified [`Error`]. Retryable kinds are retried internally; once
//! retries run out, the last error is returned as-is so callers can inspect its kind:
//!
//! ```no_run
//! use callguard::{Client, Error};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com")?.build()?;
//! match client.get::<serde_json::Value>("/reports/9").await {
//!     Ok(response) => println!("Report: {:?}", response.data),
//!     Err(Error::ClientError { status, body, .. }) => {
//!         eprintln!("Rejected ({}): {:?}", status, body);
//!     }
//!     Err(Error::ServerError { status, .. }) => eprintln!("Upstream failing: {}", status),
//!     Err(Error::Timeout) => eprintln!("Upstream too slow"),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod client;
mod config;
pub mod dedup;
mod error;
pub mod rate_limit;
pub mod request;
mod response;
pub mod retry;
mod stats;
mod transport;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use request::{Payload, RequestOptions};
pub use response::{Body, Response};
pub use retry::{RetryPolicy, RetryPredicate};
pub use stats::{CacheStats, StatsSnapshot};
