//! Token bucket engine for the shared upstream client.
//!
//! Refill is computed lazily inside the store's atomic consume, so there is
//! no background refill task and two consumers can never both spend the same
//! token.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::subject::Subject;
use crate::error::{Result, TollgateError};
use crate::store::{BucketSpec, CounterStore};

/// Upstream request budget as published by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProfile {
    /// Sustained budget
    pub requests_per_hour: u32,
    /// Burst budget
    pub requests_per_minute: u32,
}

impl UpstreamProfile {
    /// Convert the profile into its minute-burst and hour-sustained buckets.
    pub fn buckets(&self) -> Result<Vec<NamedBucket>> {
        if self.requests_per_hour == 0 || self.requests_per_minute == 0 {
            return Err(TollgateError::Validation(
                "upstream profile rates must be non-zero".to_string(),
            ));
        }
        Ok(vec![
            NamedBucket::new("minute", f64::from(self.requests_per_minute), 60.0),
            NamedBucket::new("hour", f64::from(self.requests_per_hour), 3600.0),
        ])
    }
}

/// One bucket of a composed upstream policy.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedBucket {
    /// Bucket name used in store keys and metadata
    pub name: String,
    /// Capacity and refill rate
    pub spec: BucketSpec,
}

impl NamedBucket {
    /// A bucket holding `capacity` tokens that refills completely every `period_secs`.
    pub fn new(name: impl Into<String>, capacity: f64, period_secs: f64) -> Self {
        Self {
            name: name.into(),
            spec: BucketSpec {
                capacity,
                refill_per_sec: capacity / period_secs,
            },
        }
    }
}

/// Outcome of one bucket consume.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketCheck {
    /// Bucket name
    pub name: String,
    /// Bucket capacity
    pub capacity: f64,
    /// Whether the tokens were taken
    pub allowed: bool,
    /// Tokens left after the operation
    pub tokens_remaining: f64,
    /// How long until `cost` tokens will be available; zero when allowed
    pub retry_after: Duration,
}

/// Consumes tokens from the upstream client's buckets.
pub struct TokenBucketEngine {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    buckets: Vec<NamedBucket>,
}

impl TokenBucketEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        key_prefix: impl Into<String>,
        buckets: Vec<NamedBucket>,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            buckets,
        }
    }

    /// The buckets this engine composes.
    pub fn buckets(&self) -> &[NamedBucket] {
        &self.buckets
    }

    /// Refill `bucket` and take `cost` tokens if they are there.
    ///
    /// A refused consume still advances the refill clock.
    pub async fn try_consume(
        &self,
        subject: &Subject,
        bucket: &NamedBucket,
        cost: f64,
    ) -> Result<BucketCheck> {
        validate_cost(bucket, cost)?;
        let key = subject.bucket_key(&self.key_prefix, &bucket.name);

        let outcome = self.store.consume_bucket(&key, bucket.spec, cost).await?;
        let retry_after = if outcome.allowed {
            Duration::ZERO
        } else {
            let missing = (cost - outcome.tokens).max(0.0);
            Duration::from_secs_f64(missing / bucket.spec.refill_per_sec)
        };

        trace!(
            key = %key,
            tokens = outcome.tokens,
            cost = cost,
            "Consumed from token bucket"
        );
        if !outcome.allowed {
            debug!(
                key = %key,
                tokens = outcome.tokens,
                retry_after_ms = retry_after.as_millis() as u64,
                "Token bucket exhausted"
            );
        }

        Ok(BucketCheck {
            name: bucket.name.clone(),
            capacity: bucket.spec.capacity,
            allowed: outcome.allowed,
            tokens_remaining: outcome.tokens,
            retry_after,
        })
    }

    /// Report `bucket`'s current tokens without consuming any.
    pub async fn peek(&self, subject: &Subject, bucket: &NamedBucket) -> Result<BucketCheck> {
        let key = subject.bucket_key(&self.key_prefix, &bucket.name);
        let tokens = self.store.peek_bucket(&key, bucket.spec).await?;
        Ok(BucketCheck {
            name: bucket.name.clone(),
            capacity: bucket.spec.capacity,
            allowed: tokens >= 1.0,
            tokens_remaining: tokens,
            retry_after: Duration::ZERO,
        })
    }

    /// Store keys for every bucket of this subject.
    pub fn keys_for(&self, subject: &Subject) -> Vec<String> {
        self.buckets
            .iter()
            .map(|bucket| subject.bucket_key(&self.key_prefix, &bucket.name))
            .collect()
    }
}

fn validate_cost(bucket: &NamedBucket, cost: f64) -> Result<()> {
    if !cost.is_finite() || cost <= 0.0 {
        return Err(TollgateError::Validation(format!(
            "bucket cost must be a positive number, got {cost}"
        )));
    }
    if cost > bucket.spec.capacity {
        return Err(TollgateError::Validation(format!(
            "cost {cost} exceeds capacity {} of bucket {}",
            bucket.spec.capacity, bucket.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::subject::SubjectKind;
    use crate::store::MemoryStore;

    fn engine(buckets: Vec<NamedBucket>) -> (Arc<ManualClock>, TokenBucketEngine) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock, TokenBucketEngine::new(store, "", buckets))
    }

    fn upstream() -> Subject {
        Subject::new(SubjectKind::Upstream, "client-1").unwrap()
    }

    #[test]
    fn test_profile_conversion() {
        let profile = UpstreamProfile {
            requests_per_hour: 500,
            requests_per_minute: 50,
        };
        let buckets = profile.buckets().unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].name, "minute");
        assert_eq!(buckets[0].spec.capacity, 50.0);
        assert!((buckets[0].spec.refill_per_sec - 50.0 / 60.0).abs() < 1e-12);
        assert_eq!(buckets[1].name, "hour");
        assert_eq!(buckets[1].spec.capacity, 500.0);
    }

    #[test]
    fn test_zero_profile_rejected() {
        let profile = UpstreamProfile {
            requests_per_hour: 0,
            requests_per_minute: 10,
        };
        assert!(profile.buckets().is_err());
    }

    #[tokio::test]
    async fn test_drain_then_refill() {
        // 60 per minute refills exactly one token per second
        let bucket = NamedBucket::new("minute", 60.0, 60.0);
        let (clock, engine) = engine(vec![bucket.clone()]);

        for _ in 0..60 {
            assert!(engine.try_consume(&upstream(), &bucket, 1.0).await.unwrap().allowed);
        }

        let refused = engine.try_consume(&upstream(), &bucket, 1.0).await.unwrap();
        assert!(!refused.allowed);
        assert_eq!(refused.retry_after, Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        let check = engine.try_consume(&upstream(), &bucket, 1.0).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.tokens_remaining, 0.0);
    }

    #[tokio::test]
    async fn test_refused_consume_advances_refill_clock() {
        let bucket = NamedBucket::new("minute", 2.0, 2.0);
        let (clock, engine) = engine(vec![bucket.clone()]);

        engine.try_consume(&upstream(), &bucket, 2.0).await.unwrap();
        clock.advance(Duration::from_millis(500));
        let refused = engine.try_consume(&upstream(), &bucket, 1.0).await.unwrap();
        assert!(!refused.allowed);
        assert_eq!(refused.tokens_remaining, 0.5);
        assert_eq!(refused.retry_after, Duration::from_millis(500));

        clock.advance(Duration::from_millis(500));
        assert!(engine.try_consume(&upstream(), &bucket, 1.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_cost_validation() {
        let bucket = NamedBucket::new("minute", 5.0, 60.0);
        let (_clock, engine) = engine(vec![bucket.clone()]);

        assert!(engine.try_consume(&upstream(), &bucket, 0.0).await.is_err());
        assert!(engine.try_consume(&upstream(), &bucket, -1.0).await.is_err());
        assert!(engine.try_consume(&upstream(), &bucket, f64::NAN).await.is_err());
        assert!(engine.try_consume(&upstream(), &bucket, 6.0).await.is_err());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let bucket = NamedBucket::new("minute", 5.0, 60.0);
        let (_clock, engine) = engine(vec![bucket.clone()]);

        engine.try_consume(&upstream(), &bucket, 2.0).await.unwrap();
        let a = engine.peek(&upstream(), &bucket).await.unwrap();
        let b = engine.peek(&upstream(), &bucket).await.unwrap();
        assert_eq!(a.tokens_remaining, 3.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_keys_for_each_bucket() {
        let profile = UpstreamProfile {
            requests_per_hour: 500,
            requests_per_minute: 50,
        };
        let (_clock, engine) = engine(profile.buckets().unwrap());
        assert_eq!(
            engine.keys_for(&upstream()),
            vec!["bucket:client-1:minute".to_string(), "bucket:client-1:hour".to_string()]
        );
    }
}
