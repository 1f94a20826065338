//! Time windows and quota tiers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Named counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-minute quota
    Minute,
    /// Per-hour quota
    Hour,
    /// Per-day quota
    Day,
}

impl TimeWindow {
    /// Every window, shortest first.
    pub const ALL: [TimeWindow; 3] = [TimeWindow::Minute, TimeWindow::Hour, TimeWindow::Day];

    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Name used in store keys and response metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minute" => Ok(TimeWindow::Minute),
            "hour" => Ok(TimeWindow::Hour),
            "day" => Ok(TimeWindow::Day),
            other => Err(TollgateError::Validation(format!(
                "unknown tier name: {other:?}"
            ))),
        }
    }
}

/// An immutable (window, limit, duration) rule.
///
/// `duration` normally equals the window's nominal length; it is kept
/// separate so a deployment can shorten a window without renaming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaTier {
    /// Which window this tier counts in
    pub window: TimeWindow,
    /// Maximum requests admitted per window
    pub limit: u64,
    /// How long a window lives after its first request
    #[serde(with = "duration_secs", default = "zero_duration")]
    pub duration: Duration,
}

impl QuotaTier {
    /// Create a tier whose duration is the window's nominal length.
    pub fn new(window: TimeWindow, limit: u64) -> Self {
        Self {
            window,
            limit,
            duration: window.duration(),
        }
    }

    /// Create a tier with an explicit duration.
    pub fn with_duration(window: TimeWindow, limit: u64, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(TollgateError::Validation(format!(
                "tier {window} must have a non-zero duration"
            )));
        }
        Ok(Self {
            window,
            limit,
            duration,
        })
    }

    /// Tier name as exposed to callers.
    pub fn name(&self) -> &'static str {
        self.window.as_str()
    }

    /// Fill in the nominal duration when a deserialized tier omitted it.
    pub(crate) fn normalized(mut self) -> Self {
        if self.duration.is_zero() {
            self.duration = self.window.duration();
        }
        self
    }
}

/// Check that an ordered tier set names each window at most once.
pub fn validate_tiers(tiers: &[QuotaTier]) -> Result<()> {
    for (i, tier) in tiers.iter().enumerate() {
        if tiers[..i].iter().any(|t| t.window == tier.window) {
            return Err(TollgateError::Validation(format!(
                "tier {} appears more than once",
                tier.window
            )));
        }
        if tier.duration.is_zero() {
            return Err(TollgateError::Validation(format!(
                "tier {} must have a non-zero duration",
                tier.window
            )));
        }
    }
    Ok(())
}

fn zero_duration() -> Duration {
    Duration::ZERO
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
