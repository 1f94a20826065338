//! Quota policy resolution.
//!
//! Maps an authenticated principal to exactly one ordered tier set. The table
//! is data, not code: a new principal kind means a new table row, not a new
//! branch in the engines.

use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::subject::{Subject, SubjectKind};
use super::tier::{validate_tiers, QuotaTier, TimeWindow};
use crate::error::{Result, TollgateError};

/// Default per-key thresholds when a key leaves one unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyDefaults {
    #[serde(default = "default_key_per_minute")]
    pub per_minute: u64,
    #[serde(default = "default_key_per_hour")]
    pub per_hour: u64,
    #[serde(default = "default_key_per_day")]
    pub per_day: u64,
}

impl Default for ApiKeyDefaults {
    fn default() -> Self {
        Self {
            per_minute: default_key_per_minute(),
            per_hour: default_key_per_hour(),
            per_day: default_key_per_day(),
        }
    }
}

fn default_key_per_minute() -> u64 {
    60
}

fn default_key_per_hour() -> u64 {
    1000
}

fn default_key_per_day() -> u64 {
    10000
}

/// The policy table, one row per principal kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Tiers for unauthenticated callers
    #[serde(default = "default_anonymous_tiers")]
    pub anonymous: Vec<QuotaTier>,
    /// Tiers for authenticated users without a key
    #[serde(default = "default_user_tiers")]
    pub user: Vec<QuotaTier>,
    /// Fallback thresholds for API keys
    #[serde(default)]
    pub api_key_defaults: ApiKeyDefaults,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            anonymous: default_anonymous_tiers(),
            user: default_user_tiers(),
            api_key_defaults: ApiKeyDefaults::default(),
        }
    }
}

fn default_anonymous_tiers() -> Vec<QuotaTier> {
    vec![QuotaTier::new(TimeWindow::Hour, 100)]
}

fn default_user_tiers() -> Vec<QuotaTier> {
    vec![QuotaTier::new(TimeWindow::Hour, 1000)]
}

impl PolicyTable {
    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quota policy table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PolicyTable = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policy table: {}", e)))?;
        table.normalized()
    }

    /// Fill in tier durations and check every row.
    pub fn normalized(mut self) -> Result<Self> {
        self.anonymous = self.anonymous.into_iter().map(QuotaTier::normalized).collect();
        self.user = self.user.into_iter().map(QuotaTier::normalized).collect();
        validate_tiers(&self.anonymous)?;
        validate_tiers(&self.user)?;
        Ok(self)
    }
}

/// An issued API key as vouched for by the authentication layer.
///
/// Expiry is checked by that layer before a grant reaches the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyGrant {
    /// The key value
    pub key: String,
    /// Per-minute threshold; `None` uses the table default
    pub per_minute: Option<u64>,
    /// Per-hour threshold; `None` uses the table default
    pub per_hour: Option<u64>,
    /// Per-day threshold; `None` uses the table default
    pub per_day: Option<u64>,
    /// Whether the key is enabled
    pub active: bool,
}

impl ApiKeyGrant {
    /// An active key using default thresholds.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            per_minute: None,
            per_hour: None,
            per_day: None,
            active: true,
        }
    }

    /// Set all three thresholds.
    pub fn with_limits(mut self, per_minute: u64, per_hour: u64, per_day: u64) -> Self {
        self.per_minute = Some(per_minute);
        self.per_hour = Some(per_hour);
        self.per_day = Some(per_day);
        self
    }
}

/// A resolved caller, as handed over by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Unauthenticated caller, keyed by client address
    Anonymous { client_addr: String },
    /// Authenticated user without an API key
    User { user_id: String },
    /// Caller presenting an issued API key
    ApiKey(ApiKeyGrant),
}

impl Principal {
    /// The subject this principal is counted as.
    pub fn subject(&self) -> Result<Subject> {
        match self {
            Principal::Anonymous { client_addr } => {
                Subject::new(SubjectKind::Anonymous, client_addr.as_str())
            }
            Principal::User { user_id } => Subject::new(SubjectKind::User, user_id.as_str()),
            Principal::ApiKey(grant) => Subject::new(SubjectKind::ApiKey, grant.key.as_str()),
        }
    }
}

/// A subject and the tiers it must pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub subject: Subject,
    pub tiers: Vec<QuotaTier>,
}

/// Resolves principals to quota policies.
pub struct QuotaPolicyResolver {
    table: RwLock<PolicyTable>,
}

impl QuotaPolicyResolver {
    pub fn new(table: PolicyTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }

    /// Replace the policy table.
    pub fn set_table(&self, table: PolicyTable) -> Result<()> {
        let table = table.normalized()?;
        *self.table.write() = table;
        info!("Quota policy table replaced");
        Ok(())
    }

    /// Get the current table.
    pub fn table(&self) -> PolicyTable {
        self.table.read().clone()
    }

    /// Resolve the single policy that applies to `principal`.
    ///
    /// API keys use their own thresholds, falling back per threshold to the
    /// table defaults. Tiers are never merged across principal kinds.
    pub fn resolve(&self, principal: &Principal) -> Result<QuotaPolicy> {
        let subject = principal.subject()?;
        let table = self.table.read();

        let tiers = match principal {
            Principal::Anonymous { .. } => table.anonymous.clone(),
            Principal::User { .. } => table.user.clone(),
            Principal::ApiKey(grant) => {
                if !grant.active {
                    return Err(TollgateError::Validation("api key is inactive".to_string()));
                }
                let defaults = table.api_key_defaults;
                vec![
                    QuotaTier::new(
                        TimeWindow::Minute,
                        grant.per_minute.unwrap_or(defaults.per_minute),
                    ),
                    QuotaTier::new(TimeWindow::Hour, grant.per_hour.unwrap_or(defaults.per_hour)),
                    QuotaTier::new(TimeWindow::Day, grant.per_day.unwrap_or(defaults.per_day)),
                ]
            }
        };

        debug!(subject = %subject, tiers = tiers.len(), "Resolved quota policy");
        Ok(QuotaPolicy { subject, tiers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> QuotaPolicyResolver {
        QuotaPolicyResolver::new(PolicyTable::default())
    }

    #[test]
    fn test_anonymous_gets_hourly_tier() {
        let policy = resolver()
            .resolve(&Principal::Anonymous {
                client_addr: "10.0.0.1".to_string(),
            })
            .unwrap();

        assert_eq!(policy.subject.kind, SubjectKind::Anonymous);
        assert_eq!(policy.tiers, vec![QuotaTier::new(TimeWindow::Hour, 100)]);
    }

    #[test]
    fn test_user_gets_hourly_tier() {
        let policy = resolver()
            .resolve(&Principal::User {
                user_id: "42".to_string(),
            })
            .unwrap();

        assert_eq!(policy.tiers, vec![QuotaTier::new(TimeWindow::Hour, 1000)]);
    }

    #[test]
    fn test_api_key_uses_own_thresholds() {
        let grant = ApiKeyGrant::new("k1").with_limits(5, 50, 500);
        let policy = resolver().resolve(&Principal::ApiKey(grant)).unwrap();

        assert_eq!(
            policy.tiers,
            vec![
                QuotaTier::new(TimeWindow::Minute, 5),
                QuotaTier::new(TimeWindow::Hour, 50),
                QuotaTier::new(TimeWindow::Day, 500),
            ]
        );
    }

    #[test]
    fn test_api_key_falls_back_per_threshold() {
        let mut grant = ApiKeyGrant::new("k1");
        grant.per_hour = Some(7);
        let policy = resolver().resolve(&Principal::ApiKey(grant)).unwrap();

        let limits: Vec<u64> = policy.tiers.iter().map(|t| t.limit).collect();
        assert_eq!(limits, vec![60, 7, 10000]);
    }

    #[test]
    fn test_inactive_key_rejected() {
        let r = resolver();

        let mut inactive = ApiKeyGrant::new("k1");
        inactive.active = false;
        assert!(matches!(
            r.resolve(&Principal::ApiKey(inactive)),
            Err(TollgateError::Validation(_))
        ));
        assert!(r.resolve(&Principal::ApiKey(ApiKeyGrant::new("k1"))).is_ok());
    }

    #[test]
    fn test_malformed_subject_rejected() {
        let err = resolver()
            .resolve(&Principal::User {
                user_id: String::new(),
            })
            .unwrap_err();
        assert!(matches!(err, TollgateError::Validation(_)));
    }

    #[test]
    fn test_parse_policy_table() {
        let yaml = r#"
anonymous:
  - window: minute
    limit: 10
  - window: hour
    limit: 100
user:
  - window: hour
    limit: 2000
api_key_defaults:
  per_minute: 30
"#;
        let table = PolicyTable::from_yaml(yaml).unwrap();

        assert_eq!(table.anonymous.len(), 2);
        assert_eq!(table.anonymous[0].duration, TimeWindow::Minute.duration());
        assert_eq!(table.user, vec![QuotaTier::new(TimeWindow::Hour, 2000)]);
        assert_eq!(table.api_key_defaults.per_minute, 30);
        assert_eq!(table.api_key_defaults.per_day, 10000);
    }

    #[test]
    fn test_parse_rejects_unknown_window() {
        let yaml = r#"
anonymous:
  - window: fortnight
    limit: 10
"#;
        assert!(matches!(
            PolicyTable::from_yaml(yaml),
            Err(TollgateError::Config(_))
        ));
    }

    #[test]
    fn test_set_table_takes_effect() {
        let r = resolver();
        let mut table = PolicyTable::default();
        table.anonymous = vec![QuotaTier::new(TimeWindow::Minute, 3)];
        r.set_table(table).unwrap();

        let policy = r
            .resolve(&Principal::Anonymous {
                client_addr: "10.0.0.1".to_string(),
            })
            .unwrap();
        assert_eq!(policy.tiers, vec![QuotaTier::new(TimeWindow::Minute, 3)]);
    }
}
