//! Per-client request statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters owned by one client. Reset only through
/// [`Client::reset_stats`](crate::Client::reset_stats).
#[derive(Debug, Default)]
pub(crate) struct Stats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    deduplicated_requests: AtomicU64,
}

impl Stats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_requests: usize) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            pending_requests,
        }
    }

    pub fn cache_stats(&self, size: usize) -> CacheStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.requests,
            &self.cache_hits,
            &self.cache_misses,
            &self.retries,
            &self.errors,
            &self.timeouts,
            &self.deduplicated_requests,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time copy of a client's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Calls made, cache hits included.
    pub requests: u64,
    /// GETs answered from the cache.
    pub cache_hits: u64,
    /// Cacheable GETs that had to go upstream.
    pub cache_misses: u64,
    /// Retries scheduled after a failed attempt.
    pub retries: u64,
    /// Calls that ended in an error.
    pub errors: u64,
    /// Attempts aborted by their timeout.
    pub timeouts: u64,
    /// Calls that joined an identical request already in flight.
    pub deduplicated_requests: u64,
    /// Distinct requests currently in flight through the deduplicator.
    pub pending_requests: usize,
}

/// Cache occupancy and effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries currently stored.
    pub size: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// `hits / (hits + misses)`, or `0.0` before any lookup.
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = Stats::default();
        assert_eq!(stats.cache_stats(0).hit_rate, 0.0);

        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();

        let cache = stats.cache_stats(2);
        assert_eq!(cache.hits, 3);
        assert_eq!(cache.misses, 1);
        assert_eq!(cache.hit_rate, 0.75);
    }

    #[test]
    fn test_reset_zeroes_every_counter() {
        let stats = Stats::default();
        stats.record_request();
        stats.record_retry();
        stats.record_error();
        stats.record_timeout();
        stats.record_deduplicated();

        stats.reset();
        assert_eq!(
            stats.snapshot(0),
            StatsSnapshot {
                requests: 0,
                cache_hits: 0,
                cache_misses: 0,
                retries: 0,
                errors: 0,
                timeouts: 0,
                deduplicated_requests: 0,
                pending_requests: 0,
            }
        );
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let stats = Stats::default();
        stats.record_deduplicated();
        let json = serde_json::to_value(stats.snapshot(1)).unwrap();
        assert_eq!(json["deduplicatedRequests"], 1);
        assert_eq!(json["pendingRequests"], 1);
    }
}
