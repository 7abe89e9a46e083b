//! # Level-Triggered Reconciliation Controller
//!
//! Keeps a local view of a remote, mutable resource collection in sync with
//! a change stream and drives each resource toward its desired state by
//! repeatedly invoking an idempotent reconcile function.
//!
//! ## Features
//!
//! - **Authoritative local cache**: populated from an initial listing, kept
//!   current by Add/Update/Delete events
//! - **Deduplicating work queue**: at most one in-flight reconcile per key;
//!   updates arriving mid-flight coalesce into exactly one follow-up
//! - **Bounded concurrency**: a fixed-size worker pool drains the queue
//! - **Automatic retries**: exponential backoff per key with a give-up
//!   threshold; given-up keys are recorded in a drop log
//! - **Graceful shutdown**: watch-channel signalling, in-flight reconciles
//!   finish normally
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ChangeStream                           │
//! │  (initial listing + Add/Update/Delete event subscription)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (seeds + maintains ResourceCache, enqueues affected keys)  │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                ▼                              ▼
//! ┌──────────────────────────┐   ┌─────────────────────────────┐
//! │      ResourceCache       │   │         WorkQueue            │
//! │  (key → latest snapshot) │   │  (dedup, rate limit, retry)  │
//! └──────────────────────────┘   └─────────────────────────────┘
//!                ▲                              │
//!                │                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (N workers: get key, look up snapshot, call Reconciler)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keel_controller::prelude::*;
//!
//! let stream = InMemoryChangeStream::new();
//! let controller = Controller::new(
//!     stream.clone(),
//!     |key: ResourceKey, endpoint: Option<Arc<Endpoint>>| async move {
//!         match endpoint {
//!             Some(ep) => println!("converge {key} -> {ep:?}"),
//!             None => println!("{key} is gone, tear down"),
//!         }
//!         Ok(())
//!     },
//!     ControllerConfig::default().with_workers(4),
//! );
//!
//! controller.start().await?;
//! // ... feed events through the stream ...
//! controller.shutdown().await?;
//! ```

pub mod cache;
pub mod controller;
pub mod dispatch;
pub mod queue;
pub mod reconcile;
pub mod stream;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cache::ResourceCache;
    pub use crate::controller::{
        Controller, ControllerConfig, ControllerError, ControllerStatus,
    };
    pub use crate::queue::{RetryPolicy, WorkQueue};
    pub use crate::reconcile::{ReconcileError, Reconciler};
    pub use crate::stream::{
        ChangeStream, InMemoryChangeStream, Resource, ResourceEvent, ResourceKey, StreamError,
        Tombstone,
    };
    pub use crate::worker::{DropLog, DroppedKey};
}

// Re-export key types at crate root
pub use cache::ResourceCache;
pub use controller::{Controller, ControllerConfig, ControllerError, ControllerStatus};
pub use queue::{RetryPolicy, WorkQueue};
pub use reconcile::{ReconcileError, Reconciler};
pub use stream::{
    ChangeStream, InMemoryChangeStream, Resource, ResourceEvent, ResourceKey, StreamError,
    Tombstone,
};
pub use worker::{DropLog, DroppedKey, WorkerPool};
