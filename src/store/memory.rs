//! In-process store backed by `DashMap`.
//!
//! Suitable for single-instance deployments and tests. Each key lives in one
//! shard and every operation holds that shard's lock for its whole
//! read-modify-write, which gives the same per-key atomicity the remote store
//! provides through server-side scripts.
//!
//! Expired window counters are invisible to reads at once and are swept out of
//! the map every few thousand increments, standing in for the remote store's
//! own key expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{BucketOutcome, BucketSpec, CounterStore, WindowCount};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::error::Result;

/// Window increments between two sweeps of expired counters.
const DEFAULT_SWEEP_EVERY: u64 = 4096;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u64,
    expires_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    tokens: f64,
    last_refill: u64,
}

/// In-memory counter store.
#[derive(Debug)]
pub struct MemoryStore {
    windows: DashMap<String, WindowEntry>,
    buckets: DashMap<String, BucketEntry>,
    clock: Arc<dyn Clock>,
    increments: AtomicU64,
    sweep_every: u64,
}

impl MemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            buckets: DashMap::new(),
            clock,
            increments: AtomicU64::new(0),
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }

    /// Sweep expired counters every `increments` window increments.
    pub fn with_sweep_every(mut self, increments: u64) -> Self {
        self.sweep_every = increments.max(1);
        self
    }

    /// Drop window counters whose expiry has passed.
    ///
    /// Expired entries are already invisible to reads; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.windows.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired window counters");
        }
        purged
    }

    /// Number of live window counters.
    pub fn window_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.windows
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    /// Number of window counters held in memory, expired ones included.
    pub fn stored_windows(&self) -> usize {
        self.windows.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<WindowCount> {
        let now = self.clock.now_millis();
        let fresh = WindowEntry {
            count: 0,
            expires_at: now.saturating_add(duration_millis(ttl)),
        };

        let count = {
            let mut entry = self.windows.entry(key.to_owned()).or_insert(fresh);
            if entry.expires_at <= now {
                *entry = fresh;
            }
            entry.count += 1;
            WindowCount {
                used: entry.count,
                resets_in: Duration::from_millis(entry.expires_at - now),
            }
        };

        // The shard lock above must be released before sweeping.
        let increments = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if increments % self.sweep_every == 0 {
            self.purge_expired();
        }

        Ok(count)
    }

    async fn read_window(&self, key: &str) -> Result<Option<WindowCount>> {
        let now = self.clock.now_millis();
        Ok(self
            .windows
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| WindowCount {
                used: entry.count,
                resets_in: Duration::from_millis(entry.expires_at - now),
            }))
    }

    async fn consume_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: f64,
    ) -> Result<BucketOutcome> {
        let now = self.clock.now_millis();
        let mut entry = self.buckets.entry(key.to_owned()).or_insert(BucketEntry {
            tokens: spec.capacity,
            last_refill: now,
        });

        let tokens = spec.refill(entry.tokens, now.saturating_sub(entry.last_refill));
        let allowed = tokens >= cost;
        entry.tokens = if allowed { tokens - cost } else { tokens };
        entry.last_refill = now;

        Ok(BucketOutcome {
            allowed,
            tokens: entry.tokens,
        })
    }

    async fn peek_bucket(&self, key: &str, spec: BucketSpec) -> Result<f64> {
        let now = self.clock.now_millis();
        Ok(match self.buckets.get(key) {
            Some(entry) => spec.refill(entry.tokens, now.saturating_sub(entry.last_refill)),
            None => spec.capacity,
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.windows.remove(key);
            self.buckets.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    fn store_at(start: u64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_incr_window_creates_and_counts() {
        let (_clock, store) = store_at(0);

        let first = store.incr_window("k", MINUTE).await.unwrap();
        assert_eq!(first.used, 1);
        assert_eq!(first.resets_in, MINUTE);

        let second = store.incr_window("k", MINUTE).await.unwrap();
        assert_eq!(second.used, 2);
    }

    #[tokio::test]
    async fn test_increment_never_extends_expiry() {
        let (clock, store) = store_at(0);

        store.incr_window("k", MINUTE).await.unwrap();
        clock.advance(Duration::from_secs(45));
        let count = store.incr_window("k", MINUTE).await.unwrap();

        assert_eq!(count.used, 2);
        assert_eq!(count.resets_in, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_window_expires_and_restarts() {
        let (clock, store) = store_at(0);

        for _ in 0..3 {
            store.incr_window("k", MINUTE).await.unwrap();
        }
        clock.advance(MINUTE);

        assert!(store.read_window("k").await.unwrap().is_none());
        let count = store.incr_window("k", MINUTE).await.unwrap();
        assert_eq!(count.used, 1);
        assert_eq!(count.resets_in, MINUTE);
    }

    #[tokio::test]
    async fn test_read_window_does_not_mutate() {
        let (_clock, store) = store_at(0);
        store.incr_window("k", MINUTE).await.unwrap();

        let a = store.read_window("k").await.unwrap();
        let b = store.read_window("k").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_bucket_starts_full_and_refills() {
        let (clock, store) = store_at(0);
        let spec = BucketSpec {
            capacity: 2.0,
            refill_per_sec: 1.0,
        };

        assert!(store.consume_bucket("b", spec, 1.0).await.unwrap().allowed);
        assert!(store.consume_bucket("b", spec, 1.0).await.unwrap().allowed);
        let refused = store.consume_bucket("b", spec, 1.0).await.unwrap();
        assert!(!refused.allowed);
        assert_eq!(refused.tokens, 0.0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.peek_bucket("b", spec).await.unwrap(), 1.0);
        assert!(store.consume_bucket("b", spec, 1.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_peek_missing_bucket_is_full() {
        let (_clock, store) = store_at(0);
        let spec = BucketSpec {
            capacity: 5.0,
            refill_per_sec: 1.0,
        };
        assert_eq!(store.peek_bucket("nope", spec).await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let (clock, store) = store_at(0);
        store.incr_window("a", MINUTE).await.unwrap();
        store.incr_window("b", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.window_count(), 2);

        store.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(store.window_count(), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_expired_windows_are_swept_without_explicit_purge() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone()).with_sweep_every(100);

        for i in 0..500 {
            store.incr_window(&format!("client-{i}"), MINUTE).await.unwrap();
        }
        assert_eq!(store.stored_windows(), 500);

        clock.advance(Duration::from_secs(7200));
        for _ in 0..100 {
            store.incr_window("client-live", MINUTE).await.unwrap();
        }

        assert_eq!(store.stored_windows(), 1);
        assert_eq!(store.read_window("client-live").await.unwrap().unwrap().used, 100);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.incr_window("hot", MINUTE).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let count = store.read_window("hot").await.unwrap().unwrap();
        assert_eq!(count.used, 800);
    }
}
