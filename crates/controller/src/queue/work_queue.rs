//! The work queue proper
//!
//! Semantics, per key:
//! - a key is delivered to at most one worker at a time
//! - adding a key that is already pending is a no-op
//! - adding a key that is in flight marks it dirty; it is re-delivered
//!   exactly once after the current processing finishes
//!
//! So a burst of events for one key collapses into a single delivery, and
//! nothing observed while a key was in flight is ever silently dropped.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use super::rate_limit::{KeyRateLimiter, RetryPolicy};

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shut_down: bool,
}

/// Deduplicating work queue with per-key rate limiting
///
/// Used through an `Arc`: workers block on [`get`](WorkQueue::get), the
/// dispatcher calls [`add`](WorkQueue::add), and the failure policy calls
/// [`add_rate_limited`](WorkQueue::add_rate_limited) /
/// [`forget`](WorkQueue::forget).
///
/// Ordering is roughly FIFO among ready keys; delayed entries join the back
/// of the queue once their delay elapses. After
/// [`shut_down`](WorkQueue::shut_down), `get` returns `None` immediately and
/// pending entries are discarded.
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    ready: Notify,
    shutdown_tx: watch::Sender<bool>,
    limiter: KeyRateLimiter<K>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a queue with the given backoff policy
    pub fn new(policy: RetryPolicy) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shut_down: false,
            }),
            ready: Notify::new(),
            shutdown_tx,
            limiter: KeyRateLimiter::new(policy),
        }
    }

    /// Enqueue a key for processing
    ///
    /// No-op if the key is already pending. If the key is in flight it is
    /// marked dirty instead and re-delivered once after `done`.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        if !inner.dirty.insert(key.clone()) {
            // Already pending, or already marked for redelivery
            return;
        }
        if inner.processing.contains(&key) {
            trace!(key = ?key, "key dirtied while in flight");
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.ready.notify_one();
    }

    /// Wait for the next key, marking it in flight
    ///
    /// Returns `None` once the queue has been shut down. Every `Some` must
    /// be paired with a [`done`](WorkQueue::done) call.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register interest before checking state, so an add or
            // shutdown racing with the check cannot be missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.shut_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        self.ready.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key no longer in flight
    ///
    /// If the key was dirtied while being processed, it is re-queued
    /// immediately.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        let requeue = inner.dirty.contains(key) && !inner.shut_down;
        if requeue {
            inner.queue.push_back(key.clone());
        }
        drop(inner);
        if requeue {
            self.ready.notify_one();
        }
    }

    /// Enqueue a key after a delay
    ///
    /// The delay races the queue's shutdown signal, so delayed entries die
    /// with the queue.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = shutdown_rx.changed() => {}
            }
        });
    }

    /// Re-enqueue a failed key after its backoff delay
    ///
    /// Increments the key's consecutive-failure count and schedules the
    /// redelivery accordingly.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.next_delay(&key);
        debug!(
            key = ?key,
            requeues = self.limiter.requeues(&key),
            delay_ms = delay.as_millis() as u64,
            "re-queueing after failure"
        );
        self.add_after(key, delay);
    }

    /// Clear a key's failure history
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Consecutive-failure count for a key
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.requeues(key)
    }

    /// Shut the queue down
    ///
    /// Idempotent. Pending entries are discarded, blocked `get` callers are
    /// woken with `None`, and outstanding delayed adds are cancelled.
    /// In-flight keys are unaffected; their `done` calls still complete.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.queue.clear();
            inner.dirty.clear();
        }
        let _ = self.shutdown_tx.send(true);
        self.ready.notify_waiters();
    }

    /// Number of keys pending delivery
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.lock().processing.len()
    }

    /// Whether the queue has been shut down
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        Arc::new(WorkQueue::new(RetryPolicy::default()))
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("c");

        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert_eq!(q.get().await, Some("c"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_pending_key_is_deduplicated() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("a");

        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_dirty_while_in_flight_redelivers_once() {
        let q = queue();
        q.add("a");

        let key = q.get().await.unwrap();
        assert_eq!(q.in_flight(), 1);

        // Three events arrive while "a" is being processed
        q.add("a");
        q.add("a");
        q.add("a");
        assert!(q.is_empty(), "in-flight key must not be double-queued");

        q.done(&key);

        // Exactly one redelivery
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_dirty_does_not_requeue() {
        let q = queue();
        q.add("a");

        let key = q.get().await.unwrap();
        q.done(&key);

        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let q = queue();

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };

        tokio::task::yield_now().await;
        q.add("a");

        assert_eq!(waiter.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_waiters() {
        let q = queue();

        let mut waiters = vec![];
        for _ in 0..4 {
            let q = Arc::clone(&q);
            waiters.push(tokio::spawn(async move { q.get().await }));
        }

        tokio::task::yield_now().await;
        q.shut_down();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_discards_pending_and_rejects_adds() {
        let q = queue();
        q.add("a");
        q.shut_down();

        assert_eq!(q.get().await, None);

        q.add("b");
        assert_eq!(q.get().await, None);
        assert!(q.is_shut_down());

        // Idempotent
        q.shut_down();
    }

    #[tokio::test]
    async fn test_in_flight_key_can_finish_after_shutdown() {
        let q = queue();
        q.add("a");

        let key = q.get().await.unwrap();
        q.shut_down();

        // done on an in-flight key after shutdown neither panics nor
        // resurrects the key
        q.add("a");
        q.done(&key);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_after_delay() {
        let q = queue();
        q.add_after("a", Duration::from_secs(3));

        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_delayed_adds() {
        let q = queue();
        q.add_after("a", Duration::from_secs(10));
        q.shut_down();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_delays_grow() {
        let q = queue();

        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 1);

        // First retry lands after the 5ms base delay
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");

        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);

        // Second retry needs the doubled delay
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_resets_backoff() {
        let q = queue();

        q.add_rate_limited("a");
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);

        // After forget, the next failure starts from the base delay again
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 1);
        tokio::time::sleep(Duration::from_millis(6)).await;
        // Both the forgotten and the fresh schedule have fired by now; the
        // key is deduplicated into a single pending entry
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_no_concurrent_delivery_of_same_key() {
        let q = queue();
        q.add("a");

        let key = q.get().await.unwrap();
        q.add("a");

        // While "a" is in flight a second worker sees nothing
        let contender = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                tokio::select! {
                    key = q.get() => key,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => None,
                }
            })
        };
        assert_eq!(contender.await.unwrap(), None);

        q.done(&key);
        assert_eq!(q.get().await, Some("a"));
    }
}
