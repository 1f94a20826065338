//! Admission decisions and their response rendering.
//!
//! Pure aggregation over engine results; nothing here touches the store.

use std::time::Duration;

use serde::Serialize;

use super::bucket::BucketCheck;
use super::window::TierCheck;

/// HTTP-equivalent status for a throttled request.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Which quota family produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionScope {
    /// The application's own endpoints
    Endpoint,
    /// The shared upstream dependency
    Upstream,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A tier or bucket is exhausted
    QuotaExceeded,
    /// The store failed and the policy fails closed
    StoreUnavailable,
    /// The request could not be mapped to a valid subject or cost
    InvalidRequest,
}

/// One tier's usage as exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierSnapshot {
    /// Tier or bucket name (minute/hour/day)
    pub name: String,
    /// Configured limit or bucket capacity
    pub limit: u64,
    /// Requests counted or tokens spent
    pub used: u64,
    /// Requests or whole tokens left
    pub remaining: u64,
    /// Time until the tier frees up
    #[serde(skip)]
    pub resets_in: Duration,
}

impl From<&TierCheck> for TierSnapshot {
    fn from(check: &TierCheck) -> Self {
        Self {
            name: check.tier.name().to_string(),
            limit: check.tier.limit,
            used: check.used,
            remaining: check.remaining,
            resets_in: check.resets_in,
        }
    }
}

impl From<&BucketCheck> for TierSnapshot {
    fn from(check: &BucketCheck) -> Self {
        let limit = check.capacity.floor() as u64;
        let remaining = (check.tokens_remaining.max(0.0).floor() as u64).min(limit);
        Self {
            name: check.name.clone(),
            limit,
            used: limit - remaining,
            remaining,
            resets_in: check.retry_after,
        }
    }
}

/// Machine-readable reject signal for the response layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Always 429
    pub status: u16,
    /// Stable error code
    pub error: &'static str,
    /// Human-readable explanation
    pub message: String,
    /// Whole seconds to wait, at least one
    pub retry_after: u64,
}

/// The per-request admission verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Quota family that decided
    pub scope: DecisionScope,
    /// Per-tier usage, in policy order
    pub tiers: Vec<TierSnapshot>,
    /// Whole seconds, at least one; only set on denial
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    /// Why the request was refused; only set on denial
    pub deny_reason: Option<DenyReason>,
    /// Whether the store failed while deciding
    pub degraded: bool,
}

impl AdmissionDecision {
    /// Allow without consulting any quota.
    pub fn unrestricted(scope: DecisionScope) -> Self {
        Self {
            allowed: true,
            scope,
            tiers: Vec::new(),
            retry_after: None,
            deny_reason: None,
            degraded: false,
        }
    }

    /// AND-compose window tier checks.
    ///
    /// When several tiers fail, the one that resets soonest sets the
    /// retry-after.
    pub fn from_window_checks(checks: &[TierCheck]) -> Self {
        let tiers = checks.iter().map(TierSnapshot::from).collect();
        let binding = checks
            .iter()
            .filter(|c| !c.allowed)
            .map(|c| c.resets_in)
            .min();
        Self::compose(DecisionScope::Endpoint, tiers, binding)
    }

    /// AND-compose token bucket checks, with the same tie-break as windows.
    pub fn from_bucket_checks(checks: &[BucketCheck]) -> Self {
        let tiers = checks.iter().map(TierSnapshot::from).collect();
        let binding = checks
            .iter()
            .filter(|c| !c.allowed)
            .map(|c| c.retry_after)
            .min();
        Self::compose(DecisionScope::Upstream, tiers, binding)
    }

    /// Refuse because the store failed under a fail-closed policy.
    pub fn store_unavailable(
        scope: DecisionScope,
        tiers: Vec<TierSnapshot>,
        retry_after: Duration,
    ) -> Self {
        let mut decision = Self::deny(scope, tiers, retry_after, DenyReason::StoreUnavailable);
        decision.degraded = true;
        decision
    }

    /// Refuse a request that could not be evaluated.
    pub fn invalid(scope: DecisionScope) -> Self {
        Self::deny(scope, Vec::new(), Duration::from_secs(1), DenyReason::InvalidRequest)
    }

    /// Mark a decision as taken while the store was failing.
    pub fn into_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    fn compose(scope: DecisionScope, tiers: Vec<TierSnapshot>, binding: Option<Duration>) -> Self {
        match binding {
            Some(retry_after) => Self::deny(scope, tiers, retry_after, DenyReason::QuotaExceeded),
            None => Self {
                allowed: true,
                scope,
                tiers,
                retry_after: None,
                deny_reason: None,
                degraded: false,
            },
        }
    }

    fn deny(
        scope: DecisionScope,
        tiers: Vec<TierSnapshot>,
        retry_after: Duration,
        reason: DenyReason,
    ) -> Self {
        Self {
            allowed: false,
            scope,
            tiers,
            retry_after: Some(whole_seconds(retry_after)),
            deny_reason: Some(reason),
            degraded: false,
        }
    }

    /// Retry-after in whole seconds, present only on denial.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs())
    }

    /// Response headers: per-tier limit and remaining, plus `Retry-After` on denial.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(self.tiers.len() * 2 + 1);
        for tier in &self.tiers {
            let suffix = capitalize(&tier.name);
            headers.push((format!("X-RateLimit-Limit-{}", suffix), tier.limit.to_string()));
            headers.push((
                format!("X-RateLimit-Remaining-{}", suffix),
                tier.remaining.to_string(),
            ));
        }
        if let Some(secs) = self.retry_after_secs() {
            headers.push(("Retry-After".to_string(), secs.to_string()));
        }
        headers
    }

    /// The reject signal, or `None` when the request is allowed.
    pub fn rejection(&self) -> Option<Rejection> {
        if self.allowed {
            return None;
        }
        let retry_after = self.retry_after_secs().unwrap_or(1);
        let message = match self.scope {
            DecisionScope::Endpoint => format!(
                "Request was throttled. Expected available in {} seconds.",
                retry_after
            ),
            DecisionScope::Upstream => format!(
                "Upstream rate limit exceeded. Expected available in {} seconds.",
                retry_after
            ),
        };
        Some(Rejection {
            status: TOO_MANY_REQUESTS,
            error: "throttled",
            message,
            retry_after,
        })
    }
}

/// Round up to whole seconds, never below one.
fn whole_seconds(d: Duration) -> Duration {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::tier::{QuotaTier, TimeWindow};

    fn check(window: TimeWindow, limit: u64, used: u64, resets_in_secs: u64) -> TierCheck {
        TierCheck {
            tier: QuotaTier::new(window, limit),
            allowed: used <= limit,
            used,
            remaining: limit.saturating_sub(used),
            resets_in: Duration::from_secs(resets_in_secs),
        }
    }

    #[test]
    fn test_all_tiers_pass() {
        let decision = AdmissionDecision::from_window_checks(&[
            check(TimeWindow::Minute, 60, 1, 60),
            check(TimeWindow::Hour, 1000, 1, 3600),
        ]);

        assert!(decision.allowed);
        assert!(decision.rejection().is_none());
        assert_eq!(decision.retry_after, None);
        assert_eq!(decision.tiers[0].remaining, 59);
        assert_eq!(decision.tiers[1].name, "hour");
    }

    #[test]
    fn test_any_failing_tier_denies() {
        let decision = AdmissionDecision::from_window_checks(&[
            check(TimeWindow::Minute, 2, 3, 42),
            check(TimeWindow::Hour, 1000, 3, 3500),
        ]);

        assert!(!decision.allowed);
        assert_eq!(decision.deny_reason, Some(DenyReason::QuotaExceeded));
        assert_eq!(decision.retry_after_secs(), Some(42));
    }

    #[test]
    fn test_soonest_reset_is_binding() {
        let decision = AdmissionDecision::from_window_checks(&[
            check(TimeWindow::Minute, 2, 3, 50),
            check(TimeWindow::Hour, 2, 3, 1800),
            check(TimeWindow::Day, 2, 3, 80000),
        ]);
        assert_eq!(decision.retry_after_secs(), Some(50));
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let mut expiring = check(TimeWindow::Minute, 1, 2, 0);
        expiring.resets_in = Duration::from_millis(10);
        let decision = AdmissionDecision::from_window_checks(&[expiring]);
        assert_eq!(decision.retry_after_secs(), Some(1));

        let mut zero = check(TimeWindow::Minute, 1, 2, 0);
        zero.resets_in = Duration::ZERO;
        let decision = AdmissionDecision::from_window_checks(&[zero]);
        assert_eq!(decision.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let mut c = check(TimeWindow::Minute, 1, 2, 0);
        c.resets_in = Duration::from_millis(2_001);
        let decision = AdmissionDecision::from_window_checks(&[c]);
        assert_eq!(decision.retry_after_secs(), Some(3));
    }

    #[test]
    fn test_rejection_message() {
        let decision =
            AdmissionDecision::from_window_checks(&[check(TimeWindow::Minute, 1, 2, 17)]);
        let rejection = decision.rejection().unwrap();

        assert_eq!(rejection.status, 429);
        assert_eq!(rejection.retry_after, 17);
        assert_eq!(
            rejection.message,
            "Request was throttled. Expected available in 17 seconds."
        );
    }

    #[test]
    fn test_headers() {
        let decision = AdmissionDecision::from_window_checks(&[
            check(TimeWindow::Minute, 60, 61, 12),
            check(TimeWindow::Day, 10000, 61, 80000),
        ]);
        let headers = decision.headers();

        assert!(headers.contains(&("X-RateLimit-Limit-Minute".to_string(), "60".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining-Minute".to_string(), "0".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining-Day".to_string(), "9939".to_string())));
        assert!(headers.contains(&("Retry-After".to_string(), "12".to_string())));
    }

    #[test]
    fn test_bucket_snapshot_and_message() {
        let checks = [
            BucketCheck {
                name: "minute".to_string(),
                capacity: 50.0,
                allowed: false,
                tokens_remaining: 0.4,
                retry_after: Duration::from_millis(720),
            },
            BucketCheck {
                name: "hour".to_string(),
                capacity: 500.0,
                allowed: true,
                tokens_remaining: 449.0,
                retry_after: Duration::ZERO,
            },
        ];
        let decision = AdmissionDecision::from_bucket_checks(&checks);

        assert!(!decision.allowed);
        assert_eq!(decision.tiers[0].remaining, 0);
        assert_eq!(decision.tiers[0].used, 50);
        assert_eq!(decision.tiers[1].used, 51);
        assert_eq!(
            decision.rejection().unwrap().message,
            "Upstream rate limit exceeded. Expected available in 1 seconds."
        );
    }

    #[test]
    fn test_store_unavailable_decision() {
        let decision = AdmissionDecision::store_unavailable(
            DecisionScope::Upstream,
            Vec::new(),
            Duration::from_secs(5),
        );
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.deny_reason, Some(DenyReason::StoreUnavailable));
        assert_eq!(decision.retry_after_secs(), Some(5));
    }

    #[test]
    fn test_invalid_decision_denies() {
        let decision = AdmissionDecision::invalid(DecisionScope::Endpoint);
        assert!(!decision.allowed);
        assert_eq!(decision.deny_reason, Some(DenyReason::InvalidRequest));
        assert_eq!(decision.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_serializes_for_stats_payloads() {
        let decision =
            AdmissionDecision::from_window_checks(&[check(TimeWindow::Hour, 100, 3, 100)]);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["tiers"][0]["name"], "hour");
        assert_eq!(json["tiers"][0]["remaining"], 97);
    }
}
