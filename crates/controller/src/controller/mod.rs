//! Controller wiring and lifecycle
//!
//! The [`Controller`] owns the cache, the work queue, the dispatcher and
//! the worker pool, constructed at startup and handed out as explicit
//! `Arc`s — no ambient globals. Startup performs a bounded initial sync
//! before any worker runs; shutdown is a single watch-channel signal that
//! drains everything deterministically.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::cache::ResourceCache;
use crate::dispatch::Dispatcher;
use crate::queue::WorkQueue;
use crate::reconcile::Reconciler;
use crate::stream::{ChangeStream, Resource, ResourceKey, StreamError};
use crate::worker::{DropLog, DroppedKey, WorkerPool};

mod config;

pub use config::{ConfigError, ControllerConfig};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Controller is performing its initial sync
    Starting,
    /// Cache is synced, workers are reconciling
    Running,
    /// Shutdown signalled, in-flight reconciles finishing
    Draining,
    /// Controller is not running
    Stopped,
}

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Initial sync did not complete in time; the controller must not
    /// dispatch workers against an incomplete cache
    #[error("initial sync did not complete within {0:?}")]
    SyncTimeout(std::time::Duration),

    /// Change stream error during startup
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Controller already running
    #[error("controller is already running")]
    AlreadyRunning,

    /// Controllers are single-use; build a new one to start again
    #[error("controller cannot be restarted after shutdown")]
    NotRestartable,

    /// Graceful shutdown timed out
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Level-triggered reconciliation controller
///
/// # Example
///
/// ```ignore
/// use keel_controller::prelude::*;
///
/// let controller = Controller::new(stream, reconciler, ControllerConfig::default());
/// controller.start().await?;
/// // ...
/// controller.shutdown().await?;
/// ```
pub struct Controller<R, S, H>
where
    R: Resource,
    S: ChangeStream<R>,
    H: Reconciler<R>,
{
    cache: Arc<ResourceCache<R>>,
    queue: Arc<WorkQueue<ResourceKey>>,
    pool: WorkerPool<R, H>,
    config: ControllerConfig,
    synced_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<ControllerStatus>,
    dispatcher: Mutex<Option<Dispatcher<R, S>>>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R, S, H> Controller<R, S, H>
where
    R: Resource,
    S: ChangeStream<R>,
    H: Reconciler<R>,
{
    /// Wire up a controller over the given stream and reconciler
    pub fn new(stream: S, reconciler: H, config: ControllerConfig) -> Self {
        let cache = Arc::new(ResourceCache::new());
        let queue = Arc::new(WorkQueue::new(config.retry.clone()));
        let drop_log = Arc::new(DropLog::new(config.drop_log_capacity));
        let (synced_tx, synced_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(
            Arc::new(stream),
            Arc::clone(&cache),
            Arc::clone(&queue),
            synced_tx,
            shutdown_rx,
        );
        let pool = WorkerPool::new(
            Arc::clone(&cache),
            Arc::clone(&queue),
            Arc::new(reconciler),
            drop_log,
            config.max_retries,
        );

        Self {
            cache,
            queue,
            pool,
            config,
            synced_rx,
            shutdown_tx,
            status: RwLock::new(ControllerStatus::Stopped),
            dispatcher: Mutex::new(Some(dispatcher)),
            dispatch_handle: Mutex::new(None),
        }
    }

    /// Pre-seed the cache before `start`
    ///
    /// Warmed entries that turn out to be absent from the initial listing
    /// are reconciled as deleted, so the controller reacts to resources
    /// that disappeared while it was down.
    pub fn warm(&self, resource: R) {
        self.cache.insert(resource.key(), resource);
    }

    /// Start the controller
    ///
    /// Performs the initial sync (bounded by `sync_timeout`), then spawns
    /// the dispatcher and `workers` reconcile workers. Returns only once
    /// the cache is synced; a sync failure is startup-fatal and no worker
    /// is ever dispatched against an incomplete cache.
    #[instrument(skip(self), fields(workers = self.config.workers))]
    pub async fn start(&self) -> Result<(), ControllerError> {
        self.config.validate()?;

        {
            let mut status = self.status.write();
            if *status != ControllerStatus::Stopped {
                return Err(ControllerError::AlreadyRunning);
            }
            *status = ControllerStatus::Starting;
        }

        let dispatcher = match self.dispatcher.lock().take() {
            Some(dispatcher) => dispatcher,
            None => {
                *self.status.write() = ControllerStatus::Stopped;
                return Err(ControllerError::NotRestartable);
            }
        };

        info!(workers = self.config.workers, "starting controller");

        let events = match timeout(self.config.sync_timeout, dispatcher.sync()).await {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                error!(error = %err, "initial sync failed");
                *self.status.write() = ControllerStatus::Stopped;
                return Err(err.into());
            }
            Err(_) => {
                error!(
                    timeout_ms = self.config.sync_timeout.as_millis() as u64,
                    "timed out waiting for initial sync"
                );
                *self.status.write() = ControllerStatus::Stopped;
                return Err(ControllerError::SyncTimeout(self.config.sync_timeout));
            }
        };

        // The dispatcher task is monitored: if it dies for any reason —
        // stream closure or panic — the cache can no longer be trusted to
        // stay current, so a controlled shutdown is triggered.
        let dispatch = tokio::spawn(dispatcher.run(events));
        let queue = Arc::clone(&self.queue);
        let shutdown_tx = self.shutdown_tx.clone();
        let monitor = tokio::spawn(async move {
            match dispatch.await {
                Ok(()) => {}
                Err(err) if err.is_panic() => {
                    error!("dispatcher panicked, initiating controlled shutdown");
                }
                Err(_) => warn!("dispatcher task cancelled"),
            }
            let _ = shutdown_tx.send(true);
            queue.shut_down();
        });
        *self.dispatch_handle.lock() = Some(monitor);

        self.pool.spawn_workers(self.config.workers);

        *self.status.write() = ControllerStatus::Running;
        info!("controller running");
        Ok(())
    }

    /// Shut the controller down gracefully
    ///
    /// Safe to invoke more than once. Signals the dispatcher and delayed
    /// re-adds, shuts the queue down (unblocking every worker), and waits
    /// up to `shutdown_timeout` for in-flight reconciles to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        {
            let mut status = self.status.write();
            if *status == ControllerStatus::Stopped {
                return Ok(());
            }
            *status = ControllerStatus::Draining;
        }

        info!("initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
        self.queue.shut_down();

        if timeout(self.config.shutdown_timeout, self.pool.wait())
            .await
            .is_err()
        {
            warn!("workers did not drain in time");
            return Err(ControllerError::ShutdownTimeout);
        }

        let monitor = self.dispatch_handle.lock().take();
        if let Some(monitor) = monitor {
            if timeout(self.config.shutdown_timeout, monitor).await.is_err() {
                warn!("dispatcher did not exit in time");
                return Err(ControllerError::ShutdownTimeout);
            }
        }

        *self.status.write() = ControllerStatus::Stopped;
        info!("controller stopped");
        Ok(())
    }

    /// Start, then park until shutdown is signalled
    ///
    /// Returns after a `shutdown` call from another task, or after the
    /// dispatcher dies and triggers a controlled shutdown.
    pub async fn run(&self) -> Result<(), ControllerError> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        self.shutdown().await
    }

    /// Whether the initial sync has completed
    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Current lifecycle state
    pub fn status(&self) -> ControllerStatus {
        *self.status.read()
    }

    /// The local resource cache
    pub fn cache(&self) -> &Arc<ResourceCache<R>> {
        &self.cache
    }

    /// The work queue (introspection: depth, requeue counts)
    pub fn queue(&self) -> &Arc<WorkQueue<ResourceKey>> {
        &self.queue
    }

    /// Keys given up on since startup
    pub fn dropped(&self) -> Vec<DroppedKey> {
        self.pool.drop_log().entries()
    }

    /// The configuration in use
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconcileError;
    use crate::stream::{InMemoryChangeStream, ResourceEvent};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone)]
    struct Endpoint(String);

    impl Resource for Endpoint {
        fn key(&self) -> ResourceKey {
            ResourceKey::from(self.0.as_str())
        }
    }

    async fn noop(
        _key: ResourceKey,
        _resource: Option<Arc<Endpoint>>,
    ) -> Result<(), ReconcileError> {
        Ok(())
    }

    fn controller(
        stream: InMemoryChangeStream<Endpoint>,
    ) -> Controller<
        Endpoint,
        InMemoryChangeStream<Endpoint>,
        impl Reconciler<Endpoint>,
    > {
        Controller::new(
            stream,
            noop,
            ControllerConfig::default().with_shutdown_timeout(Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let c = controller(InMemoryChangeStream::new());
        assert_eq!(c.status(), ControllerStatus::Stopped);
        assert!(!c.has_synced());

        c.start().await.unwrap();
        assert_eq!(c.status(), ControllerStatus::Running);
        assert!(c.has_synced());

        c.shutdown().await.unwrap();
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let c = controller(InMemoryChangeStream::new());
        c.start().await.unwrap();

        assert!(matches!(
            c.start().await,
            Err(ControllerError::AlreadyRunning)
        ));

        c.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_restart_after_shutdown() {
        let c = controller(InMemoryChangeStream::new());
        c.start().await.unwrap();
        c.shutdown().await.unwrap();

        assert!(matches!(
            c.start().await,
            Err(ControllerError::NotRestartable)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let c = controller(InMemoryChangeStream::new());
        c.start().await.unwrap();

        c.shutdown().await.unwrap();
        c.shutdown().await.unwrap();
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_a_no_op() {
        let c = controller(InMemoryChangeStream::new());
        c.shutdown().await.unwrap();
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }

    /// A stream whose listing never completes
    struct HangingStream;

    #[async_trait]
    impl ChangeStream<Endpoint> for HangingStream {
        async fn list(&self) -> Result<Vec<Endpoint>, StreamError> {
            futures::future::pending().await
        }

        async fn subscribe(
            &self,
        ) -> Result<mpsc::UnboundedReceiver<ResourceEvent<Endpoint>>, StreamError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_timeout_is_startup_fatal() {
        let c = Controller::new(
            HangingStream,
            noop,
            ControllerConfig::default().with_sync_timeout(Duration::from_millis(100)),
        );

        match c.start().await {
            Err(ControllerError::SyncTimeout(waited)) => {
                assert_eq!(waited, Duration::from_millis(100));
            }
            other => panic!("expected SyncTimeout, got {other:?}"),
        }
        assert_eq!(c.status(), ControllerStatus::Stopped);
        assert!(!c.has_synced());
    }

    /// A stream whose listing fails outright
    struct FailingStream;

    #[async_trait]
    impl ChangeStream<Endpoint> for FailingStream {
        async fn list(&self) -> Result<Vec<Endpoint>, StreamError> {
            Err(StreamError::ListFailed("collection unavailable".into()))
        }

        async fn subscribe(
            &self,
        ) -> Result<mpsc::UnboundedReceiver<ResourceEvent<Endpoint>>, StreamError> {
            let (_tx, rx) = mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_list_failure_is_startup_fatal() {
        let c = Controller::new(FailingStream, noop, ControllerConfig::default());

        assert!(matches!(
            c.start().await,
            Err(ControllerError::Stream(StreamError::ListFailed(_)))
        ));
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stream_closure_triggers_controlled_shutdown() {
        let stream = InMemoryChangeStream::new();
        let c = controller(stream.clone());
        c.start().await.unwrap();

        stream.close();

        timeout(Duration::from_secs(1), async {
            while !c.queue().is_shut_down() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("queue was never shut down after stream closure");

        c.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_parks_until_shutdown() {
        let c = Arc::new(controller(InMemoryChangeStream::new()));

        let runner = {
            let c = Arc::clone(&c);
            tokio::spawn(async move { c.run().await })
        };

        timeout(Duration::from_secs(1), async {
            while c.status() != ControllerStatus::Running {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("controller never came up");

        c.shutdown().await.unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(c.status(), ControllerStatus::Stopped);
    }
}
