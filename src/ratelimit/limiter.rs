//! The quota limiter: policy resolution, both engines and the degradation
//! policy behind one entry point per request.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bucket::{BucketCheck, TokenBucketEngine};
use super::decision::{AdmissionDecision, DecisionScope, TierSnapshot};
use super::degradation::{FailMode, StoreGuard, StoreState};
use super::policy::{PolicyTable, Principal, QuotaPolicyResolver};
use super::subject::{Subject, SubjectKind};
use super::window::{TierCheck, WindowCounterEngine};
use crate::config::{StoreBackend, TollgateConfig};
use crate::error::{Result, TollgateError};
use crate::store::{CounterStore, MemoryStore, RedisStore};

/// Read-only usage of one subject, per tier or bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub subject: Subject,
    pub tiers: Vec<TierSnapshot>,
}

/// Admission control for endpoint quotas and the shared upstream budget.
///
/// Holds no counter state of its own; any number of limiters, in any number
/// of processes, may share one store.
pub struct QuotaLimiter {
    enabled: bool,
    store: Arc<dyn CounterStore>,
    resolver: QuotaPolicyResolver,
    windows: WindowCounterEngine,
    buckets: TokenBucketEngine,
    upstream: Subject,
    guard: StoreGuard,
    window_mode: FailMode,
    bucket_mode: FailMode,
    degraded_retry_after: Duration,
}

impl QuotaLimiter {
    /// Build a limiter over an existing store.
    pub fn new(config: &TollgateConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;

        let table = config.policy.clone().normalized()?;
        let upstream = Subject::new(SubjectKind::Upstream, config.upstream.client_id.as_str())?;
        let buckets = config.upstream.profile()?.buckets()?;
        let prefix = config.store.key_prefix.as_str();

        info!(
            enabled = config.enabled,
            upstream = %upstream,
            environment = %config.upstream.environment,
            window_mode = ?config.degradation.window_mode,
            bucket_mode = ?config.degradation.bucket_mode,
            "Quota limiter initialized"
        );

        Ok(Self {
            enabled: config.enabled,
            resolver: QuotaPolicyResolver::new(table),
            windows: WindowCounterEngine::new(store.clone(), prefix),
            buckets: TokenBucketEngine::new(store.clone(), prefix, buckets),
            store,
            upstream,
            guard: StoreGuard::new(
                config.store.operation_timeout(),
                config.store.retry_on_error,
            ),
            window_mode: config.degradation.window_mode,
            bucket_mode: config.degradation.bucket_mode,
            degraded_retry_after: Duration::from_secs(config.degradation.retry_after_secs),
        })
    }

    /// Open the configured store and build a limiter over it.
    pub async fn connect(config: &TollgateConfig) -> Result<Self> {
        let store: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redis => {
                let connect = RedisStore::connect(&config.store.url);
                // Connection setup gets a few round trips' worth of time.
                let deadline = config.store.operation_timeout() * 4;
                match tokio::time::timeout(deadline, connect).await {
                    Ok(store) => Arc::new(store?),
                    Err(_) => {
                        return Err(TollgateError::StoreUnavailable(format!(
                            "connecting to {} timed out",
                            config.store.url
                        )))
                    }
                }
            }
        };
        Self::new(config, store)
    }

    /// Decide whether `principal` may call an application endpoint.
    ///
    /// Every tier of the resolved policy is counted, and the request is
    /// admitted only if all of them admit it.
    pub async fn admit(&self, principal: &Principal) -> AdmissionDecision {
        if !self.enabled {
            return AdmissionDecision::unrestricted(DecisionScope::Endpoint);
        }

        let policy = match self.resolver.resolve(principal) {
            Ok(policy) => policy,
            Err(err) => {
                warn!(error = %err, "Refusing request without a usable quota policy");
                return AdmissionDecision::invalid(DecisionScope::Endpoint);
            }
        };

        let mut checks = Vec::with_capacity(policy.tiers.len());
        for tier in &policy.tiers {
            let result = self
                .guard
                .run("incr_window", || {
                    self.windows.check_and_increment(&policy.subject, tier)
                })
                .await;
            match result {
                Ok(check) => checks.push(check),
                Err(err) if err.is_store_failure() => {
                    return self.degraded_window_decision(&policy.subject, &checks)
                }
                Err(err) => {
                    warn!(subject = %policy.subject, error = %err, "Refusing request");
                    return AdmissionDecision::invalid(DecisionScope::Endpoint);
                }
            }
        }

        AdmissionDecision::from_window_checks(&checks)
    }

    /// Decide whether one outbound call costing `cost` tokens may go to the
    /// upstream dependency. Every bucket must have the tokens.
    ///
    /// Buckets are tried in order and evaluation stops at the first refusal,
    /// so a refused call never spends tokens from the buckets after it.
    pub async fn admit_upstream(&self, cost: f64) -> AdmissionDecision {
        if !self.enabled {
            return AdmissionDecision::unrestricted(DecisionScope::Upstream);
        }

        let mut checks = Vec::with_capacity(self.buckets.buckets().len());
        for bucket in self.buckets.buckets() {
            let result = self
                .guard
                .run("consume_bucket", || {
                    self.buckets.try_consume(&self.upstream, bucket, cost)
                })
                .await;
            match result {
                Ok(check) => {
                    let refused = !check.allowed;
                    checks.push(check);
                    if refused {
                        break;
                    }
                }
                Err(err) if err.is_store_failure() => {
                    return self.degraded_bucket_decision(&checks)
                }
                Err(err) => {
                    warn!(cost = cost, error = %err, "Refusing upstream call");
                    return AdmissionDecision::invalid(DecisionScope::Upstream);
                }
            }
        }

        AdmissionDecision::from_bucket_checks(&checks)
    }

    /// Current usage of `principal`'s tiers. Never changes any counter.
    pub async fn get_usage(&self, principal: &Principal) -> Result<UsageReport> {
        let policy = self.resolver.resolve(principal)?;
        let reads = policy.tiers.iter().map(|tier| {
            let subject = &policy.subject;
            self.guard
                .run("read_window", move || self.windows.peek(subject, tier))
        });

        let tiers = join_all(reads)
            .await
            .into_iter()
            .map(|check| check.map(|c| TierSnapshot::from(&c)))
            .collect::<Result<Vec<_>>>()?;

        Ok(UsageReport {
            subject: policy.subject,
            tiers,
        })
    }

    /// Current token levels of the upstream buckets. Never consumes tokens.
    pub async fn get_upstream_usage(&self) -> Result<UsageReport> {
        let reads = self.buckets.buckets().iter().map(|bucket| {
            self.guard
                .run("peek_bucket", move || self.buckets.peek(&self.upstream, bucket))
        });

        let tiers = join_all(reads)
            .await
            .into_iter()
            .map(|check| check.map(|c| TierSnapshot::from(&c)))
            .collect::<Result<Vec<_>>>()?;

        Ok(UsageReport {
            subject: self.upstream.clone(),
            tiers,
        })
    }

    /// Delete every window counter held for `subject`.
    pub async fn reset(&self, subject: &Subject) -> Result<()> {
        let keys = self.windows.keys_for(subject);
        self.guard.run("delete", || self.store.delete(&keys)).await?;
        info!(subject = %subject, "Reset window counters");
        Ok(())
    }

    /// Refill the upstream buckets by deleting them.
    pub async fn reset_upstream(&self) -> Result<()> {
        let keys = self.buckets.keys_for(&self.upstream);
        self.guard.run("delete", || self.store.delete(&keys)).await?;
        info!(subject = %self.upstream, "Reset upstream buckets");
        Ok(())
    }

    /// Whether the store answered the most recent operation.
    pub fn store_state(&self) -> StoreState {
        self.guard.state()
    }

    /// Replace the endpoint policy table.
    pub fn set_policy_table(&self, table: PolicyTable) -> Result<()> {
        self.resolver.set_table(table)
    }

    /// The endpoint policy table in effect.
    pub fn policy_table(&self) -> PolicyTable {
        self.resolver.table()
    }

    /// The subject the upstream buckets are kept for.
    pub fn upstream_subject(&self) -> &Subject {
        &self.upstream
    }

    fn degraded_window_decision(
        &self,
        subject: &Subject,
        checks: &[TierCheck],
    ) -> AdmissionDecision {
        match self.window_mode {
            FailMode::FailOpen => {
                debug!(subject = %subject, "Store unavailable, failing open");
                AdmissionDecision::from_window_checks(checks).into_degraded()
            }
            FailMode::FailClosed => {
                debug!(subject = %subject, "Store unavailable, failing closed");
                AdmissionDecision::store_unavailable(
                    DecisionScope::Endpoint,
                    checks.iter().map(TierSnapshot::from).collect(),
                    self.degraded_retry_after,
                )
            }
        }
    }

    fn degraded_bucket_decision(&self, checks: &[BucketCheck]) -> AdmissionDecision {
        match self.bucket_mode {
            FailMode::FailOpen => {
                debug!(subject = %self.upstream, "Store unavailable, failing open");
                AdmissionDecision::from_bucket_checks(checks).into_degraded()
            }
            FailMode::FailClosed => {
                debug!(subject = %self.upstream, "Store unavailable, failing closed");
                AdmissionDecision::store_unavailable(
                    DecisionScope::Upstream,
                    checks.iter().map(TierSnapshot::from).collect(),
                    self.degraded_retry_after,
                )
            }
        }
    }
}
