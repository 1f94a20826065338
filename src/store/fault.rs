//! Fault-injecting store wrapper.
//!
//! Wraps another store and, while switched on, fails or stalls every call.
//! Used to rehearse store outages against the degradation policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{BucketOutcome, BucketSpec, CounterStore, WindowCount};
use crate::error::{Result, TollgateError};

/// How an injected fault manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call returns `StoreUnavailable` immediately
    Error,
    /// Every call sleeps for the given time before delegating
    Stall(Duration),
}

/// A store that can be told to misbehave.
pub struct FaultyStore {
    inner: Arc<dyn CounterStore>,
    fault: parking_lot::Mutex<Option<Fault>>,
    calls: AtomicU64,
}

impl FaultyStore {
    /// Wrap a healthy store.
    pub fn new(inner: Arc<dyn CounterStore>) -> Self {
        Self {
            inner,
            fault: parking_lot::Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    /// Start injecting `fault` into every call.
    pub fn inject(&self, fault: Fault) {
        *self.fault.lock() = Some(fault);
    }

    /// Stop injecting faults.
    pub fn heal(&self) {
        *self.fault.lock() = None;
    }

    /// Number of calls that reached this wrapper.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fault = *self.fault.lock();
        match fault {
            Some(Fault::Error) => Err(TollgateError::StoreUnavailable(
                "injected store failure".to_string(),
            )),
            Some(Fault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CounterStore for FaultyStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<WindowCount> {
        self.before_call().await?;
        self.inner.incr_window(key, ttl).await
    }

    async fn read_window(&self, key: &str) -> Result<Option<WindowCount>> {
        self.before_call().await?;
        self.inner.read_window(key).await
    }

    async fn consume_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: f64,
    ) -> Result<BucketOutcome> {
        self.before_call().await?;
        self.inner.consume_bucket(key, spec, cost).await
    }

    async fn peek_bucket(&self, key: &str, spec: BucketSpec) -> Result<f64> {
        self.before_call().await?;
        self.inner.peek_bucket(key, spec).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.before_call().await?;
        self.inner.delete(keys).await
    }
}
