//! Worker pool
//!
//! A fixed number of tokio tasks drain the work queue. Each worker takes
//! one key at a time, looks up the latest snapshot in the cache (absent
//! means deleted), invokes the reconciler, and applies the retry/give-up
//! policy:
//!
//! - success → forget the key's failure history
//! - failure below the retry threshold → re-queue with backoff
//! - failure at the threshold → forget, record in the [`DropLog`], drop
//!
//! Reconciler panics are contained per attempt and count as failures; they
//! never take the worker (or the process) down.

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::ResourceCache;
use crate::queue::WorkQueue;
use crate::reconcile::{ReconcileError, Reconciler};
use crate::stream::{Resource, ResourceKey};

mod dropped;

pub use dropped::{DropLog, DroppedKey};

/// Fixed-size pool of reconcile workers
///
/// The pool does not own shutdown: shutting down the queue is what makes
/// workers exit (their `get` returns `None`), after which
/// [`wait`](WorkerPool::wait) resolves. In-flight reconciles always finish
/// normally.
pub struct WorkerPool<R, H> {
    cache: Arc<ResourceCache<R>>,
    queue: Arc<WorkQueue<ResourceKey>>,
    reconciler: Arc<H>,
    drop_log: Arc<DropLog>,
    max_retries: u32,
    tracker: TaskTracker,
}

impl<R, H> WorkerPool<R, H>
where
    R: Resource,
    H: Reconciler<R>,
{
    /// Create a pool over the shared cache and queue
    pub fn new(
        cache: Arc<ResourceCache<R>>,
        queue: Arc<WorkQueue<ResourceKey>>,
        reconciler: Arc<H>,
        drop_log: Arc<DropLog>,
        max_retries: u32,
    ) -> Self {
        Self {
            cache,
            queue,
            reconciler,
            drop_log,
            max_retries,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn `count` worker loops
    pub fn spawn_workers(&self, count: usize) {
        for _ in 0..count {
            let worker_id = format!("worker-{}", Uuid::now_v7());
            let cache = Arc::clone(&self.cache);
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            let drop_log = Arc::clone(&self.drop_log);
            let max_retries = self.max_retries;

            self.tracker.spawn(async move {
                debug!(%worker_id, "worker started");
                while let Some(key) = queue.get().await {
                    process_key(
                        &key,
                        &cache,
                        &queue,
                        reconciler.as_ref(),
                        &drop_log,
                        max_retries,
                    )
                    .await;
                    queue.done(&key);
                }
                debug!(%worker_id, "worker exited");
            });
        }
    }

    /// Wait for every worker to exit
    ///
    /// Resolves once the queue has been shut down and all workers have
    /// finished their in-flight work.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// The give-up record
    pub fn drop_log(&self) -> &Arc<DropLog> {
        &self.drop_log
    }
}

/// One reconcile attempt for one key, plus the failure policy
async fn process_key<R, H>(
    key: &ResourceKey,
    cache: &ResourceCache<R>,
    queue: &Arc<WorkQueue<ResourceKey>>,
    reconciler: &H,
    drop_log: &DropLog,
    max_retries: u32,
) where
    R: Resource,
    H: Reconciler<R>,
{
    let resource = cache.get(key);
    let attempt = queue.num_requeues(key) + 1;
    debug!(%key, attempt, present = resource.is_some(), "reconciling");

    let outcome = std::panic::AssertUnwindSafe(reconciler.reconcile(key, resource))
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic);
            error!(%key, panic = %message, "reconciler panicked");
            Err(ReconcileError::new(format!("reconciler panicked: {message}")))
        }
    };

    match result {
        Ok(()) => {
            // Clear the backoff history so the next failure for this key
            // starts from the base delay
            queue.forget(key);
        }
        Err(err) => {
            let requeues = queue.num_requeues(key);
            if requeues < max_retries {
                warn!(
                    %key,
                    requeues,
                    error = %err,
                    "reconcile failed, re-queueing with backoff"
                );
                queue.add_rate_limited(key.clone());
            } else {
                queue.forget(key);
                drop_log.record(key.clone(), requeues + 1, err.to_string());
                error!(
                    %key,
                    attempts = requeues + 1,
                    error = %err,
                    "giving up on key after repeated failures"
                );
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
