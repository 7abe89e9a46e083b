//! Deduplicating, rate-limited work queue
//!
//! This module provides:
//! - [`WorkQueue`] - Ordered queue of keys with at-most-one-in-flight
//!   semantics per key, async blocking `get`, and delayed re-adds
//! - [`RetryPolicy`] - Exponential backoff curve for failed keys
//! - [`KeyRateLimiter`] - Explicit per-key consecutive-failure counters
//!
//! The queue decouples change notification from processing: however many
//! events arrive for a key while it is pending or in flight, workers see it
//! exactly once more, and always reconcile against the latest cached state.

mod rate_limit;
mod work_queue;

pub use rate_limit::{KeyRateLimiter, RetryPolicy};
pub use work_queue::WorkQueue;
