//! Bounded, time-expiring store of successful GET responses.
//!
//! Entries are evicted two ways: lazily when a read finds them past their TTL, and by
//! least-recently-used order when an insert would push the cache over capacity. There is no
//! background sweeper.

use crate::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    // `None` when the TTL reaches past what `Instant` can represent.
    expires_at: Option<Instant>,
}

/// LRU + TTL cache keyed by canonical request key.
///
/// Every operation takes the lock for a few map operations only; values are cloned out so no
/// reader ever holds a reference into the map.
///
/// # Examples
///
/// ```
/// use callguard::cache::RequestCache;
/// use std::time::Duration;
///
/// let cache = RequestCache::new(2).unwrap();
/// cache.set("GET https://api.example.com/a", "a", Duration::from_secs(60));
/// assert_eq!(cache.get("GET https://api.example.com/a"), Some("a"));
/// ```
#[derive(Debug)]
pub struct RequestCache<V> {
    entries: Mutex<LruCache<String, CacheEntry<V>>>,
}

impl<V: Clone> RequestCache<V> {
    /// Creates a cache holding at most `max_size` entries.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_size` is zero.
    pub fn new(max_size: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_size).ok_or_else(|| {
            Error::ConfigurationError("Cache size must be greater than zero".to_string())
        })?;

        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Returns the cached value for `key` if present and still fresh.
    ///
    /// A hit refreshes the entry's recency. An expired entry is removed and reported absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expires_at.map_or(true, |at| at > now) => {
                return Some(entry.value.clone())
            }
            Some(_) => {}
            None => return None,
        }

        entries.pop(key);
        tracing::trace!(key = %key, "Cache entry expired");
        None
    }

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    ///
    /// Evicts the least recently used entry first when the cache is full. A TTL too large to
    /// represent (such as `Duration::MAX`) keeps the entry until it is evicted or removed.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };

        let key = key.into();
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                tracing::trace!(key = %evicted, "Evicted least recently used cache entry");
            }
        }
    }

    /// Removes a single entry.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().pop(key).map(|entry| entry.value)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
