//! Per-key retry rate limiting
//!
//! Failed keys are re-queued after an exponentially growing delay. The
//! consecutive-failure count lives here as an explicit counter per key, so
//! callers (and tests) can inspect retry state without depending on timing.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff curve for failed keys
///
/// The n-th consecutive failure of a key is re-queued after
/// `base_delay * 2^(n-1)`, capped at `max_delay`. Defaults follow the
/// common controller curve: 5 ms doubling up to 1000 s.
///
/// # Example
///
/// ```
/// use keel_controller::queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_base_delay(Duration::from_millis(10))
///     .with_max_delay(Duration::from_secs(60));
///
/// assert_eq!(policy.delay_for_requeue(1), Duration::from_millis(10));
/// assert_eq!(policy.delay_for_requeue(2), Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Ceiling for the computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// Defaults to 0.0 so retry delays for a key are strictly
    /// non-decreasing. Turn on a small fraction when many controllers
    /// share a downstream dependency.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default curve
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first retry
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay ceiling
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given requeue (1-based consecutive-failure count)
    pub fn delay_for_requeue(&self, requeues: u32) -> Duration {
        if requeues == 0 {
            return Duration::ZERO;
        }

        let exponent = (requeues - 1).min(63) as i32;
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Tracks consecutive failures per key and computes backoff delays
///
/// Counters reset on `forget` (success or give-up) and never persist past
/// process lifetime.
pub struct KeyRateLimiter<K> {
    policy: RetryPolicy,
    requeues: DashMap<K, u32>,
}

impl<K> KeyRateLimiter<K>
where
    K: Clone + Eq + Hash,
{
    /// Create a limiter with the given backoff policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            requeues: DashMap::new(),
        }
    }

    /// Record another failure for the key and return the delay before its
    /// next delivery
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut entry = self.requeues.entry(key.clone()).or_insert(0);
        *entry += 1;
        self.policy.delay_for_requeue(*entry)
    }

    /// Current consecutive-failure count for the key
    pub fn requeues(&self, key: &K) -> u32 {
        self.requeues.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Clear the key's failure history
    pub fn forget(&self, key: &K) {
        self.requeues.remove(key);
    }

    /// Number of keys currently carrying failure history
    pub fn tracked_keys(&self) -> usize {
        self.requeues.len()
    }

    /// The backoff policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
