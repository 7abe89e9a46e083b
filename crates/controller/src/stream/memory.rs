//! In-memory implementation of ChangeStream for testing and embedding
//!
//! Holds the collection in a map and fans events out to subscribers over
//! unbounded channels, so events emitted between `subscribe` and `list` are
//! buffered rather than lost.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{ChangeStream, Resource, ResourceEvent, ResourceKey, StreamError, Tombstone};

struct Inner<R> {
    resources: RwLock<HashMap<ResourceKey, R>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ResourceEvent<R>>>>,
}

/// In-memory change stream
///
/// Cloning yields another handle to the same collection, so a test (or an
/// embedding process) can keep one handle as the producer side while the
/// controller consumes the other.
///
/// # Example
///
/// ```
/// use keel_controller::stream::InMemoryChangeStream;
/// # use keel_controller::stream::{Resource, ResourceKey};
/// # #[derive(Clone)]
/// # struct Endpoint(String);
/// # impl Resource for Endpoint {
/// #     fn key(&self) -> ResourceKey { ResourceKey::from(self.0.as_str()) }
/// # }
///
/// let stream: InMemoryChangeStream<Endpoint> = InMemoryChangeStream::new();
/// stream.apply(Endpoint("default/web".into()));
/// stream.delete(&ResourceKey::from("default/web"));
/// ```
pub struct InMemoryChangeStream<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for InMemoryChangeStream<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource + Clone> InMemoryChangeStream<R> {
    /// Create an empty stream
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                resources: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a stream pre-populated with resources
    ///
    /// No events are emitted for the initial contents; consumers observe
    /// them through `list`.
    pub fn with_resources(resources: impl IntoIterator<Item = R>) -> Self {
        let stream = Self::new();
        {
            let mut map = stream.inner.resources.write();
            for resource in resources {
                map.insert(resource.key(), resource);
            }
        }
        stream
    }

    /// Insert or update a resource, emitting Added or Updated
    pub fn apply(&self, resource: R) {
        let key = resource.key();
        let old = self
            .inner
            .resources
            .write()
            .insert(key, resource.clone());

        let event = match old {
            Some(old) => ResourceEvent::Updated {
                old: Some(old),
                new: resource,
            },
            None => ResourceEvent::Added(resource),
        };
        self.broadcast(event);
    }

    /// Remove a resource, emitting Deleted with the last known value
    ///
    /// Unknown keys still emit a bare-key tombstone; delete notifications
    /// for already-forgotten resources happen in real streams too.
    pub fn delete(&self, key: &ResourceKey) {
        let old = self.inner.resources.write().remove(key);

        let tombstone = match old {
            Some(old) => Tombstone::Resource(old),
            None => Tombstone::Key(key.clone()),
        };
        self.broadcast(ResourceEvent::Deleted(tombstone));
    }

    /// Emit a raw event without touching the backing collection
    ///
    /// For exercising consumer tolerance of duplicates and stale events.
    pub fn emit(&self, event: ResourceEvent<R>) {
        self.broadcast(event);
    }

    /// Terminate all subscriptions
    ///
    /// Receivers observe end-of-stream after draining buffered events. The
    /// backing collection stays readable via `list`.
    pub fn close(&self) {
        self.inner.subscribers.lock().clear();
    }

    /// Number of resources currently in the collection
    pub fn len(&self) -> usize {
        self.inner.resources.read().len()
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.inner.resources.read().is_empty()
    }

    fn broadcast(&self, event: ResourceEvent<R>) {
        let mut subscribers = self.inner.subscribers.lock();
        // Drop subscribers whose receiver is gone
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<R: Resource + Clone> Default for InMemoryChangeStream<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Resource + Clone> ChangeStream<R> for InMemoryChangeStream<R> {
    async fn list(&self) -> Result<Vec<R>, StreamError> {
        Ok(self.inner.resources.read().values().cloned().collect())
    }

    async fn subscribe(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ResourceEvent<R>>, StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        Ok(rx)
    }
}
