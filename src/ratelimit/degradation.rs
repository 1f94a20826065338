//! Store degradation policy.
//!
//! Tracks whether the shared store is answering (NORMAL) or failing
//! (DEGRADED). Any failed or timed-out operation moves to DEGRADED; the next
//! successful operation moves back. There is no separate health check.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TollgateError};

/// What to do with a request when the store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Admit the request
    FailOpen,
    /// Refuse the request
    FailClosed,
}

/// Health of the shared store as seen from this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Normal,
    Degraded,
}

/// Runs store operations under a timeout and tracks store health.
#[derive(Debug)]
pub struct StoreGuard {
    timeout: Duration,
    retry: bool,
    degraded: AtomicBool,
    failures: AtomicU64,
}

impl StoreGuard {
    /// Create a guard bounding each attempt by `timeout`, with at most one
    /// fast retry when `retry` is set.
    pub fn new(timeout: Duration, retry: bool) -> Self {
        Self {
            timeout,
            retry,
            degraded: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Current store state.
    pub fn state(&self) -> StoreState {
        if self.degraded.load(Ordering::Acquire) {
            StoreState::Degraded
        } else {
            StoreState::Normal
        }
    }

    /// Total failed operations since startup.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run `op`, retrying once on a store failure, and update the store state.
    ///
    /// Errors other than `StoreUnavailable` pass through untouched and do not
    /// affect the state.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = if self.retry { 2 } else { 1 };
        let mut last_error = None;

        for attempt in 1..=attempts {
            let err = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => {
                    self.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) if err.is_store_failure() => err,
                Ok(Err(err)) => return Err(err),
                Err(_) => TollgateError::StoreUnavailable(format!(
                    "{} timed out after {}ms",
                    operation,
                    self.timeout.as_millis()
                )),
            };
            warn!(
                operation = operation,
                attempt = attempt,
                error = %err,
                "Store operation failed"
            );
            last_error = Some(err);
        }

        let err = last_error.unwrap_or_else(|| {
            TollgateError::StoreUnavailable(format!("{} was not attempted", operation))
        });
        self.record_failure(operation);
        Err(err)
    }

    fn record_success(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Counter store recovered, leaving degraded mode");
        }
    }

    fn record_failure(&self, operation: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(operation = operation, "Counter store unavailable, entering degraded mode");
        }
    }
}
