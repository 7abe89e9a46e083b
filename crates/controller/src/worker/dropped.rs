//! Record of keys the controller gave up on
//!
//! When a key exhausts its retries it is dropped from the queue; the drop
//! is recorded here so operators (and tests) can see what was abandoned and
//! why. A dropped key is not blacklisted: the next external event for it
//! starts a fresh retry run.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::stream::ResourceKey;

/// One abandoned retry run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DroppedKey {
    /// The key that was given up on
    pub key: ResourceKey,

    /// Total reconcile attempts before giving up (initial + retries)
    pub attempts: u32,

    /// The final attempt's error
    pub error: String,

    /// When the key was dropped
    pub dropped_at: DateTime<Utc>,
}

/// Bounded in-memory log of dropped keys
///
/// Oldest entries are evicted once the capacity is reached.
pub struct DropLog {
    entries: RwLock<VecDeque<DroppedKey>>,
    capacity: usize,
}

impl DropLog {
    /// Create a log retaining at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a give-up
    pub fn record(&self, key: ResourceKey, attempts: u32, error: impl Into<String>) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DroppedKey {
            key,
            attempts,
            error: error.into(),
            dropped_at: Utc::now(),
        });
    }

    /// Snapshot of all recorded drops, oldest first
    pub fn entries(&self) -> Vec<DroppedKey> {
        self.entries.read().iter().cloned().collect()
    }

    /// Number of recorded drops
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been dropped
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Discard all recorded drops
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
