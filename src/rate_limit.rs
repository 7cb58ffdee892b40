//! Outbound rate limiting and rate-limit header parsing.
//!
//! [`RateLimiter`] keeps us under the upstream quota before a request is sent: it admits at
//! most `max_requests` requests inside any trailing window. [`RateLimitInfo`] reads the hints
//! an upstream sends back once we have been throttled anyway (429 responses).

use crate::{Error, Result};
use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Sliding-window limiter over a monotonic clock.
///
/// Capacity is time-based: there is nothing to release after a request completes, admissions
/// simply age out of the window.
///
/// # Examples
///
/// ```no_run
/// use callguard::rate_limit::RateLimiter;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), callguard::Error> {
/// let limiter = RateLimiter::new(2, Duration::from_secs(1))?;
/// limiter.acquire().await;
/// limiter.acquire().await;
/// // Suspends until the first admission leaves the window.
/// limiter.acquire().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_requests` is zero or `window` is empty.
    pub fn new(max_requests: usize, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(Error::ConfigurationError(
                "Rate limit must allow at least one request per window".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(Error::ConfigurationError(
                "Rate limit window must be longer than zero".to_string(),
            ));
        }

        Ok(Self {
            max_requests,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
        })
    }

    /// Waits until one more request fits in the window, then records it.
    ///
    /// Returns the admission instant. Re-checks after every wait, since other callers may have
    /// taken the freed slot in the meantime.
    pub async fn acquire(&self) -> Instant {
        loop {
            let wait = match self.try_admit(Instant::now()) {
                Ok(admitted_at) => return admitted_at,
                Err(wait) => wait,
            };

            tracing::debug!(
                wait_ms = wait.as_millis(),
                max_requests = self.max_requests,
                "Rate limit window full - waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Admits immediately if there is room, otherwise returns how long until the oldest
    /// admission leaves the window.
    fn try_admit(&self, now: Instant) -> std::result::Result<Instant, Duration> {
        let mut admitted = self.admitted.lock();

        while let Some(&oldest) = admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < self.max_requests {
            admitted.push_back(now);
            return Ok(now);
        }

        let oldest = admitted.front().copied().unwrap_or(now);
        let wait = self
            .window
            .saturating_sub(now.saturating_duration_since(oldest));
        // A zero wait would spin; the slot frees at the next tick anyway.
        Err(wait.max(Duration::from_millis(1)))
    }

    /// Number of admissions currently inside the window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.admitted
            .lock()
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) < self.window)
            .count()
    }

    /// Forgets every recorded admission.
    pub fn reset(&self) {
        self.admitted.lock().clear();
    }
}

/// Information extracted from rate limit headers.
///
/// This struct contains parsed rate limit data from various standard and
/// common rate limit headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// When the rate limit resets (from X-RateLimit-Reset or RateLimit-Reset headers).
    pub reset_at: Option<SystemTime>,

    /// How long to wait before retrying (from Retry-After header).
    pub retry_after: Option<Duration>,

    /// Number of requests remaining in the current window.
    pub remaining: Option<u64>,
}

impl RateLimitInfo {
    /// Extracts rate limit information from HTTP response headers.
    ///
    /// Parses:
    /// - `Retry-After` (seconds or HTTP date)
    /// - `X-RateLimit-Reset` / `RateLimit-Reset` (Unix timestamp)
    /// - `X-RateLimit-Remaining`
    ///
    /// # Examples
    ///
    /// ```
    /// use callguard::rate_limit::RateLimitInfo;
    /// use http::HeaderMap;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("retry-after", "60".parse().unwrap());
    ///
    /// let info = RateLimitInfo::from_headers(&headers);
    /// assert!(info.retry_after.is_some());
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            reset_at: parse_rate_limit_reset(headers),
            retry_after: parse_retry_after(headers),
            remaining: parse_rate_limit_remaining(headers),
        }
    }

    /// Returns the upstream-requested delay, capped by `max_wait`.
    ///
    /// `Retry-After` wins over the reset timestamp. `None` when neither is usable.
    pub fn delay(&self, max_wait: Duration) -> Option<Duration> {
        if let Some(retry_after) = self.retry_after {
            return Some(retry_after.min(max_wait));
        }

        let until_reset = self.reset_at?.duration_since(SystemTime::now()).ok()?;
        Some(until_reset.min(max_wait))
    }

    /// Returns `true` if the headers carry an actionable wait hint.
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after.is_some() || self.reset_at.is_some() || self.remaining == Some(0)
    }
}

/// Parses the Retry-After header, as delay-seconds or an HTTP date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // A date in the past means "now".
    let date_time = httpdate::parse_http_date(header).ok()?;
    Some(
        date_time
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Parses X-RateLimit-Reset or RateLimit-Reset (Unix timestamp).
fn parse_rate_limit_reset(headers: &HeaderMap) -> Option<SystemTime> {
    ["x-ratelimit-reset", "ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name)?.to_str().ok()?.trim().parse::<u64>().ok())
        .map(|timestamp| UNIX_EPOCH + Duration::from_secs(timestamp))
        .next()
}

fn parse_rate_limit_remaining(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_rejects_empty_quota() {
        assert!(matches!(
            RateLimiter::new(0, Duration::from_secs(1)),
            Err(Error::ConfigurationError(_))
        ));
        assert!(matches!(
            RateLimiter::new(5, Duration::ZERO),
            Err(Error::ConfigurationError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_quota_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1)).unwrap();
        let start = Instant::now();

        for _ in 0..3 {
            let admitted = limiter.acquire().await;
            assert_eq!(admitted, start);
        }
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_window_to_slide() {
        let limiter = RateLimiter::new(2, Duration::from_millis(1000)).unwrap();

        let first = limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        limiter.acquire().await;

        let third = limiter.acquire().await;
        assert!(third.duration_since(first) >= Duration::from_millis(1000));
        // Only the second and third admissions remain in the window.
        assert_eq!(limiter.in_window(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_exceeds_quota_under_contention() {
        let limiter = std::sync::Arc::new(RateLimiter::new(2, Duration::from_millis(500)).unwrap());

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();

        let mut admissions = Vec::new();
        for handle in handles {
            admissions.push(handle.await.unwrap());
        }
        admissions.sort();

        // Any three consecutive admissions must span at least one full window.
        for triple in admissions.windows(3) {
            assert!(triple[2].duration_since(triple[0]) >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10)).unwrap();
        let first = limiter.acquire().await;
        limiter.reset();
        let second = limiter.acquire().await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("60"));

        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let when = SystemTime::now() + Duration::from_secs(120);
        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            HeaderValue::from_str(&httpdate::fmt_http_date(when)).unwrap(),
        );

        let delay = parse_retry_after(&headers).unwrap();
        assert!(delay > Duration::from_secs(100) && delay <= Duration::from_secs(120));
    }

    #[test]
    fn test_rate_limit_info_with_reset_and_remaining() {
        let future_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 2;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&future_timestamp.to_string()).unwrap(),
        );
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));

        let info = RateLimitInfo::from_headers(&headers);
        assert_eq!(info.remaining, Some(0));
        assert!(info.is_rate_limited());

        // Unix timestamps truncate to whole seconds.
        let delay = info.delay(Duration::from_secs(300)).unwrap();
        assert!(delay <= Duration::from_secs(3), "got {:?}", delay);
    }

    #[test]
    fn test_rate_limit_delay_capped_by_max_wait() {
        let info = RateLimitInfo {
            reset_at: None,
            retry_after: Some(Duration::from_secs(600)),
            remaining: Some(0),
        };

        assert_eq!(
            info.delay(Duration::from_secs(300)),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_no_hints_means_no_delay() {
        let info = RateLimitInfo::from_headers(&HeaderMap::new());
        assert!(!info.is_rate_limited());
        assert_eq!(info.delay(Duration::from_secs(300)), None);
    }
}
