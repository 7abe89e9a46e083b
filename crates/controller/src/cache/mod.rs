//! In-memory resource cache
//!
//! The authoritative local view of the watched collection. A single logical
//! writer (the dispatcher) applies change-stream events; reconcile logic and
//! introspection read concurrently. Readers always receive `Arc` snapshots,
//! never an alias they could observe mutating.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::stream::ResourceKey;

/// Thread-safe map from resource key to the latest known resource snapshot.
///
/// The cache is eventually consistent with the change stream: a stored value
/// always corresponds to some delivered event, and `list` reflects some
/// prefix of the event stream relative to concurrent writes. The cache never
/// calls back into the dispatcher or the work queue.
///
/// # Example
///
/// ```
/// use keel_controller::cache::ResourceCache;
/// use keel_controller::stream::ResourceKey;
///
/// let cache: ResourceCache<String> = ResourceCache::new();
/// cache.insert(ResourceKey::from("default/web"), "v1".to_string());
/// assert!(cache.get(&ResourceKey::from("default/web")).is_some());
/// ```
pub struct ResourceCache<R> {
    entries: RwLock<HashMap<ResourceKey, Arc<R>>>,
}

impl<R> ResourceCache<R> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the latest snapshot for a key, if present
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<R>> {
        self.entries.read().get(key).cloned()
    }

    /// Whether a key is present
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Store the latest value for a key, replacing any previous snapshot
    pub fn insert(&self, key: ResourceKey, resource: R) {
        self.entries.write().insert(key, Arc::new(resource));
    }

    /// Remove a key, returning the last known snapshot if there was one
    pub fn remove(&self, key: &ResourceKey) -> Option<Arc<R>> {
        self.entries.write().remove(key)
    }

    /// Snapshot of all entries
    pub fn list(&self) -> Vec<(ResourceKey, Arc<R>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Snapshot of all keys
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of cached resources
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<R> Default for ResourceCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResourceKey {
        ResourceKey::from(s)
    }

    #[test]
    fn test_insert_and_get() {
        let cache = ResourceCache::new();
        cache.insert(key("default/a"), 1u32);

        assert_eq!(cache.get(&key("default/a")).as_deref(), Some(&1));
        assert!(cache.get(&key("default/b")).is_none());
    }

    #[test]
    fn test_insert_replaces_snapshot() {
        let cache = ResourceCache::new();
        cache.insert(key("a"), "v1".to_string());

        let old = cache.get(&key("a")).unwrap();
        cache.insert(key("a"), "v2".to_string());

        // Old snapshot is unaffected by the overwrite
        assert_eq!(*old, "v1");
        assert_eq!(cache.get(&key("a")).as_deref().map(String::as_str), Some("v2"));
    }

    #[test]
    fn test_remove_returns_last_value() {
        let cache = ResourceCache::new();
        cache.insert(key("a"), 7u32);

        assert_eq!(cache.remove(&key("a")).as_deref(), Some(&7));
        assert!(cache.remove(&key("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_list_and_keys() {
        let cache = ResourceCache::new();
        cache.insert(key("a"), 1u32);
        cache.insert(key("b"), 2u32);

        assert_eq!(cache.len(), 2);

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec![key("a"), key("b")]);

        let mut listed = cache.list();
        listed.sort_by(|(a, _), (b, _)| a.cmp(b));
        assert_eq!(*listed[0].1, 1);
        assert_eq!(*listed[1].1, 2);
    }

    #[test]
    fn test_concurrent_readers() {
        let cache = Arc::new(ResourceCache::new());
        cache.insert(key("a"), 0u64);

        let mut handles = vec![];
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = cache.get(&ResourceKey::from("a"));
                    let _ = cache.len();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
