//! Change stream boundary
//!
//! The controller does not watch the remote collection itself; it consumes a
//! [`ChangeStream`]: a blocking initial listing plus a subscription that
//! yields typed Add/Update/Delete events over a channel. Wire-level concerns
//! (transports, watch protocols, resume semantics) belong to the stream
//! implementation, not to this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod memory;

pub use memory::InMemoryChangeStream;

/// Identifier uniquely naming one resource within the watched collection
/// (e.g. `namespace/name`).
///
/// Keys are the unit of deduplication and in-flight locking: the controller
/// never runs two reconciles for the same key concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a key from anything string-like
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A member of the watched collection
///
/// The only requirement the controller places on the resource type is a
/// stable key: deriving the same key for the same logical resource across
/// events is what makes deduplication and coalescing sound.
pub trait Resource: Send + Sync + 'static {
    /// Stable identifier for this resource within the collection
    fn key(&self) -> ResourceKey;
}

/// The last word on a deleted resource
///
/// Delete notifications may arrive after the live object is gone; the stream
/// then delivers whatever it still knows — the last observed value, or just
/// the key.
#[derive(Debug, Clone)]
pub enum Tombstone<R> {
    /// Last known value of the deleted resource
    Resource(R),
    /// Only the key survived
    Key(ResourceKey),
}

impl<R: Resource> Tombstone<R> {
    /// The key of the deleted resource, derivable from either form
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Resource(resource) => resource.key(),
            Self::Key(key) => key.clone(),
        }
    }

    /// The last known value, if the stream still had one
    pub fn into_last_known(self) -> Option<R> {
        match self {
            Self::Resource(resource) => Some(resource),
            Self::Key(_) => None,
        }
    }
}

/// A single change notification
///
/// Duplicates and reordering across unrelated keys are tolerated by the
/// controller; level-triggered reconciliation only ever looks at the latest
/// cached state for a key.
#[derive(Debug, Clone)]
pub enum ResourceEvent<R> {
    /// A resource appeared in the collection
    Added(R),
    /// A resource changed; `old` is absent when the producer keeps no history
    Updated { old: Option<R>, new: R },
    /// A resource left the collection
    Deleted(Tombstone<R>),
}

impl<R: Resource> ResourceEvent<R> {
    /// The key the event is about
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Added(resource) => resource.key(),
            Self::Updated { new, .. } => new.key(),
            Self::Deleted(tombstone) => tombstone.key(),
        }
    }
}

/// Errors from change stream operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Initial listing failed
    #[error("listing the collection failed: {0}")]
    ListFailed(String),

    /// Subscription could not be established
    #[error("subscribing to the change stream failed: {0}")]
    SubscribeFailed(String),

    /// The stream is closed and will produce no further events
    #[error("change stream closed")]
    Closed,
}

/// Source of truth for the watched collection
///
/// Implementations must make `subscribe` + `list` loss-free in that order:
/// events emitted while the listing runs must be buffered into the already
/// established subscription, so the consumer observes every change at least
/// once. The in-memory implementation shipped with this crate
/// ([`InMemoryChangeStream`]) does this; network-backed implementations
/// typically lean on their protocol's resume semantics.
#[async_trait]
pub trait ChangeStream<R: Resource>: Send + Sync + 'static {
    /// Bulk listing of the current collection contents
    async fn list(&self) -> Result<Vec<R>, StreamError>;

    /// Subscribe to subsequent change events
    async fn subscribe(&self)
        -> Result<mpsc::UnboundedReceiver<ResourceEvent<R>>, StreamError>;
}
