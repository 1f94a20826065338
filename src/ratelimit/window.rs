//! Fixed-window counter engine.
//!
//! Windows are anchored to the first request that creates the counter, not to
//! wall-clock boundaries: the store sets the expiry atomically with that first
//! increment and never extends it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::subject::Subject;
use super::tier::{QuotaTier, TimeWindow};
use crate::error::Result;
use crate::store::CounterStore;

/// Outcome of one tier check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCheck {
    /// The tier that was evaluated
    pub tier: QuotaTier,
    /// Whether this tier admits the request
    pub allowed: bool,
    /// Requests counted in the live window, this one included
    pub used: u64,
    /// Requests left in the live window
    pub remaining: u64,
    /// Time until the window resets
    pub resets_in: Duration,
}

impl TierCheck {
    fn new(tier: QuotaTier, used: u64, resets_in: Duration) -> Self {
        Self {
            tier,
            allowed: used <= tier.limit,
            used,
            remaining: tier.limit.saturating_sub(used),
            resets_in,
        }
    }
}

/// Counts requests per (subject, window) in the shared store.
pub struct WindowCounterEngine {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
}

impl WindowCounterEngine {
    pub fn new(store: Arc<dyn CounterStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// Count this request against `tier` and report whether it fits.
    ///
    /// The increment happens first, so the request that crosses the limit is
    /// itself counted and refused: at most `limit` requests are admitted per
    /// window.
    pub async fn check_and_increment(
        &self,
        subject: &Subject,
        tier: &QuotaTier,
    ) -> Result<TierCheck> {
        let key = subject.window_key(&self.key_prefix, tier.window);

        let count = self.store.incr_window(&key, tier.duration).await?;
        let check = TierCheck::new(*tier, count.used, count.resets_in);

        trace!(
            key = %key,
            used = check.used,
            limit = tier.limit,
            "Checked window counter"
        );
        if !check.allowed {
            debug!(
                key = %key,
                used = check.used,
                limit = tier.limit,
                resets_in_ms = check.resets_in.as_millis() as u64,
                "Window limit exceeded"
            );
        }

        Ok(check)
    }

    /// Read the current state of `tier` without counting a request.
    ///
    /// An absent counter reads as zero used and a full window ahead.
    pub async fn peek(&self, subject: &Subject, tier: &QuotaTier) -> Result<TierCheck> {
        let key = subject.window_key(&self.key_prefix, tier.window);
        let check = match self.store.read_window(&key).await? {
            Some(count) => TierCheck::new(*tier, count.used, count.resets_in),
            None => TierCheck::new(*tier, 0, tier.duration),
        };
        Ok(check)
    }

    /// Store keys for every window this subject may hold.
    pub fn keys_for(&self, subject: &Subject) -> Vec<String> {
        TimeWindow::ALL
            .iter()
            .map(|window| subject.window_key(&self.key_prefix, *window))
            .collect()
    }
}
