//! Coalescing of concurrent identical requests.
//!
//! The first caller for a key starts the work and publishes it as a shared future; callers
//! arriving while it is in flight await that same future instead of issuing their own round
//! trip. The pending entry is torn down by a guard living inside the shared future, so it
//! disappears on success, on failure, and when every caller has given up waiting.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type SharedFuture<T> = Shared<BoxFuture<'static, T>>;
type PendingMap<T> = Mutex<HashMap<String, PendingEntry<T>>>;

struct PendingEntry<T> {
    id: u64,
    // Weak so the in-flight work is dropped once nobody awaits it.
    future: WeakShared<BoxFuture<'static, T>>,
}

/// The outcome of [`RequestDeduplicator::deduplicate`].
#[derive(Debug, Clone)]
pub struct Deduplicated<T> {
    /// The value produced by the single underlying operation.
    pub value: T,
    /// `true` when this caller joined an operation started by someone else.
    pub joined: bool,
}

/// Tracks in-flight operations by key so that at most one runs per key at a time.
///
/// # Examples
///
/// ```
/// use callguard::dedup::RequestDeduplicator;
///
/// # async fn example() {
/// let dedup = RequestDeduplicator::<u32>::new();
/// let (a, b) = futures::join!(
///     dedup.deduplicate("GET /jobs", || async { 42 }),
///     dedup.deduplicate("GET /jobs", || async { 0 }),
/// );
/// assert_eq!((a.value, b.value), (42, 42));
/// assert!(b.joined);
/// # }
/// ```
pub struct RequestDeduplicator<T> {
    pending: Arc<PendingMap<T>>,
    next_id: AtomicU64,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty deduplicator.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `produce` for `key` unless an identical operation is already in flight, in which
    /// case this caller awaits that operation's outcome instead.
    ///
    /// `produce` is invoked at most once, and only by the caller that registers the entry.
    pub async fn deduplicate<F, Fut>(&self, key: &str, produce: F) -> Deduplicated<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (future, joined) = self.join_or_register(key, produce);

        if joined {
            tracing::debug!(key = %key, "Joined in-flight request");
        }

        Deduplicated {
            value: future.await,
            joined,
        }
    }

    fn join_or_register<F, Fut>(&self, key: &str, produce: F) -> (SharedFuture<T>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut pending = self.pending.lock();

        if let Some(existing) = pending.get(key).and_then(|entry| entry.future.upgrade()) {
            return (existing, true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = PendingGuard {
            pending: Arc::downgrade(&self.pending),
            key: key.to_string(),
            id,
        };

        // `produce` runs on first poll, outside the lock.
        let future: SharedFuture<T> = async move {
            let _guard = guard;
            produce().await
        }
        .boxed()
        .shared();

        if let Some(weak) = future.downgrade() {
            pending.insert(key.to_string(), PendingEntry { id, future: weak });
        }

        (future, false)
    }

    /// Number of keys with an operation in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if an operation for `key` is in flight.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Forgets every pending entry. Callers already waiting still receive their outcome.
    pub fn clear(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drop(drained);
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the pending entry when the in-flight operation settles or is dropped.
struct PendingGuard<T> {
    pending: Weak<PendingMap<T>>,
    key: String,
    id: u64,
}

impl<T> Drop for PendingGuard<T> {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };

        let removed = {
            let mut map = pending.lock();
            // A newer operation may already own the key.
            if map.get(&self.key).is_some_and(|entry| entry.id == self.id) {
                map.remove(&self.key)
            } else {
                None
            }
        };
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_invocation() {
        let dedup = Arc::new(RequestDeduplicator::<Result<u32, String>>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let dedup = dedup.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    dedup
                        .deduplicate("GET /status", move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(7)
                        })
                        .await
                })
            })
            .collect();

        let mut joined = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.value, Ok(7));
            if outcome.joined {
                joined += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 4);
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_entry_removed() {
        let dedup = RequestDeduplicator::<Result<u32, String>>::new();

        let (a, b) = futures::join!(
            dedup.deduplicate("k", || async {
                tokio::task::yield_now().await;
                Err("boom".to_string())
            }),
            dedup.deduplicate("k", || async { Ok(1) }),
        );

        assert_eq!(a.value, Err("boom".to_string()));
        assert_eq!(b.value, Err("boom".to_string()));
        assert!(!dedup.is_pending("k"));

        // The next call starts fresh.
        let c = dedup.deduplicate("k", || async { Ok(2) }).await;
        assert_eq!(c.value, Ok(2));
        assert!(!c.joined);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let dedup = RequestDeduplicator::<u32>::new();
        let (a, b) = futures::join!(
            dedup.deduplicate("a", || async { 1 }),
            dedup.deduplicate("b", || async { 2 }),
        );
        assert_eq!((a.value, b.value), (1, 2));
        assert!(!a.joined && !b.joined);
    }

    #[tokio::test]
    async fn test_abandoned_operation_releases_entry() {
        let dedup = RequestDeduplicator::<u32>::new();

        {
            let pending = dedup.deduplicate("k", || futures::future::pending::<u32>());
            futures::pin_mut!(pending);
            // Register the entry, then drop the only waiter.
            assert!(futures::poll!(pending.as_mut()).is_pending());
            assert!(dedup.is_pending("k"));
        }

        assert!(!dedup.is_pending("k"));
        let next = dedup.deduplicate("k", || async { 3 }).await;
        assert_eq!(next.value, 3);
    }

    #[tokio::test]
    async fn test_clear_keeps_waiters_intact() {
        let dedup = RequestDeduplicator::<u32>::new();
        let waiter = dedup.deduplicate("k", || async {
            tokio::task::yield_now().await;
            5
        });
        futures::pin_mut!(waiter);
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        dedup.clear();
        assert_eq!(dedup.pending_count(), 0);
        assert_eq!(waiter.await.value, 5);
    }
}
