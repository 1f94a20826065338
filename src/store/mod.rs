//! Shared counter store.
//!
//! The store is the only shared mutable resource: every application instance
//! coordinates through it and keeps no counter state of its own. Each method
//! is a single atomic operation on one key.

mod fault;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::fault::{Fault, FaultyStore};
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// The state of one fixed-window counter after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the live window
    pub used: u64,
    /// Time until the store expires the counter
    pub resets_in: Duration,
}

/// Capacity and refill rate of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Maximum number of tokens the bucket holds
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl BucketSpec {
    /// Lazily refill `tokens` for `elapsed_ms` of idle time, clamped to `[0, capacity]`.
    pub fn refill(&self, tokens: f64, elapsed_ms: u64) -> f64 {
        let added = elapsed_ms as f64 / 1000.0 * self.refill_per_sec;
        (tokens + added).clamp(0.0, self.capacity)
    }
}

/// Result of an atomic consume on a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether `cost` tokens were taken
    pub allowed: bool,
    /// Tokens left after the operation
    pub tokens: f64,
}

/// Trait for shared counter store implementations.
///
/// Implementations must make every method atomic with respect to concurrent
/// callers on the same key; no method spans more than one logical counter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a window counter, creating it with `ttl` if absent.
    ///
    /// The expiry is set only when the increment creates the entry and is
    /// never extended afterwards.
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<WindowCount>;

    /// Read a window counter without changing it. `None` when absent or expired.
    async fn read_window(&self, key: &str) -> Result<Option<WindowCount>>;

    /// Refill and try to take `cost` tokens, as one atomic step.
    ///
    /// A missing bucket starts full. The refill clock advances even when the
    /// consume is refused.
    async fn consume_bucket(&self, key: &str, spec: BucketSpec, cost: f64)
        -> Result<BucketOutcome>;

    /// Tokens currently available, refilled to "now", without writing.
    async fn peek_bucket(&self, key: &str, spec: BucketSpec) -> Result<f64>;

    /// Remove keys outright. Only used by administrative resets.
    async fn delete(&self, keys: &[String]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_is_linear_and_clamped() {
        let spec = BucketSpec {
            capacity: 10.0,
            refill_per_sec: 2.0,
        };

        assert_eq!(spec.refill(0.0, 1_000), 2.0);
        assert_eq!(spec.refill(3.0, 500), 4.0);
        assert_eq!(spec.refill(9.0, 60_000), 10.0);
        assert_eq!(spec.refill(-1.0, 0), 0.0);
    }
}
