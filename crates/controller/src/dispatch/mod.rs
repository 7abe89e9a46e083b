//! Dispatcher: change stream → cache + work queue
//!
//! A single task owns the subscription to the change stream. It first seeds
//! the cache from a full listing (so every pre-existing resource gets a
//! real first reconcile, and pre-warmed cache entries that are no longer
//! listed get an absence reconcile), then applies steady-state events:
//! write the cache, enqueue the key. Nothing else in the crate writes the
//! cache.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::cache::ResourceCache;
use crate::queue::WorkQueue;
use crate::stream::{ChangeStream, Resource, ResourceEvent, ResourceKey, StreamError};

/// Subscribes to the change stream and keeps cache and queue current
pub struct Dispatcher<R, S> {
    stream: Arc<S>,
    cache: Arc<ResourceCache<R>>,
    queue: Arc<WorkQueue<ResourceKey>>,
    synced_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<R, S> Dispatcher<R, S>
where
    R: Resource,
    S: ChangeStream<R>,
{
    /// Create a dispatcher over the given stream, cache and queue
    pub fn new(
        stream: Arc<S>,
        cache: Arc<ResourceCache<R>>,
        queue: Arc<WorkQueue<ResourceKey>>,
        synced_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            cache,
            queue,
            synced_tx,
            shutdown_rx,
        }
    }

    /// Establish the subscription and perform the initial sync
    ///
    /// Subscribes before listing so events racing the listing are buffered
    /// into the subscription rather than lost. Every listed resource is
    /// cached and enqueued; every cache entry absent from the listing
    /// (pre-warmed state) is removed and enqueued so its first reconcile
    /// observes the deletion. Marks has-synced on success.
    #[instrument(skip(self))]
    pub async fn sync(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ResourceEvent<R>>, StreamError> {
        let events = self.stream.subscribe().await?;
        let listed = self.stream.list().await?;

        let known = self.cache.keys();

        let mut listed_keys = std::collections::HashSet::with_capacity(listed.len());
        for resource in listed {
            let key = resource.key();
            listed_keys.insert(key.clone());
            self.cache.insert(key.clone(), resource);
            self.queue.add(key);
        }

        for key in known {
            if !listed_keys.contains(&key) {
                debug!(%key, "cached resource missing from listing, reconciling as deleted");
                self.cache.remove(&key);
                self.queue.add(key);
            }
        }

        info!(resources = listed_keys.len(), "initial sync complete");
        let _ = self.synced_tx.send(true);

        Ok(events)
    }

    /// Consume steady-state events until shutdown or stream closure
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ResourceEvent<R>>) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    debug!("dispatcher: shutdown requested");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => {
                            warn!("change stream closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Apply one event: cache write, then enqueue
    fn apply(&self, event: ResourceEvent<R>) {
        match event {
            ResourceEvent::Added(resource) => {
                let key = resource.key();
                self.cache.insert(key.clone(), resource);
                self.queue.add(key);
            }
            ResourceEvent::Updated { new, .. } => {
                let key = new.key();
                self.cache.insert(key.clone(), new);
                self.queue.add(key);
            }
            ResourceEvent::Deleted(tombstone) => {
                let key = tombstone.key();
                self.cache.remove(&key);
                self.queue.add(key);
            }
        }
    }
}
