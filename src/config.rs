//! Configuration management for Tollgate.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{FailMode, PolicyTable, UpstreamProfile};

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Global switch; when off every request is admitted
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Shared counter store
    #[serde(default)]
    pub store: StoreConfig,

    /// Endpoint quota policy table
    #[serde(default)]
    pub policy: PolicyTable,

    /// Behavior while the store is unavailable
    #[serde(default)]
    pub degradation: DegradationConfig,

    /// Shared upstream client budget
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            store: StoreConfig::default(),
            policy: PolicyTable::default(),
            degradation: DegradationConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only coordinates callers within one process
    Memory,
    /// Redis, shared by every instance
    Redis,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix prepended to every store key
    #[serde(default)]
    pub key_prefix: String,

    /// Upper bound on a single store round trip in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Retry a failed store operation once before degrading
    #[serde(default = "default_retry_on_error")]
    pub retry_on_error: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            key_prefix: String::new(),
            operation_timeout_ms: default_operation_timeout(),
            retry_on_error: default_retry_on_error(),
        }
    }
}

impl StoreConfig {
    /// The per-operation timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_retry_on_error() -> bool {
    true
}

/// Degradation policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Endpoint window counters
    #[serde(default = "default_window_mode")]
    pub window_mode: FailMode,

    /// Upstream token buckets
    #[serde(default = "default_bucket_mode")]
    pub bucket_mode: FailMode,

    /// Retry-after reported when failing closed, in seconds
    #[serde(default = "default_degraded_retry_after")]
    pub retry_after_secs: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            window_mode: default_window_mode(),
            bucket_mode: default_bucket_mode(),
            retry_after_secs: default_degraded_retry_after(),
        }
    }
}

fn default_window_mode() -> FailMode {
    FailMode::FailOpen
}

fn default_bucket_mode() -> FailMode {
    FailMode::FailClosed
}

fn default_degraded_retry_after() -> u64 {
    1
}

/// Deployment environment of the upstream credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamEnvironment {
    Sandbox,
    Development,
    Production,
}

impl UpstreamEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamEnvironment::Sandbox => "sandbox",
            UpstreamEnvironment::Development => "development",
            UpstreamEnvironment::Production => "production",
        }
    }
}

impl fmt::Display for UpstreamEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Identifier of the shared upstream credential
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Which profile applies
    #[serde(default = "default_environment")]
    pub environment: UpstreamEnvironment,

    /// Request budgets per environment
    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, UpstreamProfile>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            environment: default_environment(),
            profiles: default_profiles(),
        }
    }
}

fn default_client_id() -> String {
    "default".to_string()
}

fn default_environment() -> UpstreamEnvironment {
    UpstreamEnvironment::Sandbox
}

fn default_profiles() -> BTreeMap<String, UpstreamProfile> {
    let constrained = UpstreamProfile {
        requests_per_hour: 500,
        requests_per_minute: 50,
    };
    let production = UpstreamProfile {
        requests_per_hour: 2000,
        requests_per_minute: 100,
    };
    BTreeMap::from([
        (UpstreamEnvironment::Sandbox.to_string(), constrained),
        (UpstreamEnvironment::Development.to_string(), constrained),
        (UpstreamEnvironment::Production.to_string(), production),
    ])
}

impl UpstreamConfig {
    /// The profile for the configured environment.
    pub fn profile(&self) -> Result<UpstreamProfile> {
        self.profiles
            .get(self.environment.as_str())
            .copied()
            .ok_or_else(|| {
                TollgateError::Config(format!(
                    "no upstream profile for environment '{}'",
                    self.environment
                ))
            })
    }
}

impl TollgateConfig {
    /// Load layered configuration.
    ///
    /// Sources, lowest priority first: `config/default`, `config/{TOLLGATE_ENV}`,
    /// `config/local` (all optional), then `TOLLGATE__SECTION__KEY` variables.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));

        if let Ok(env) = std::env::var("TOLLGATE_ENV") {
            builder = builder
                .add_source(config::File::with_name(&format!("config/{}", env)).required(false));
        }

        builder = builder
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("TOLLGATE").separator("__"));

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.operation_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.operation_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.degradation.retry_after_secs == 0 {
            return Err(TollgateError::Config(
                "degradation.retry_after_secs must be > 0".to_string(),
            ));
        }
        for (name, profile) in &self.upstream.profiles {
            if profile.requests_per_hour == 0 || profile.requests_per_minute == 0 {
                return Err(TollgateError::Config(format!(
                    "upstream profile '{}' must have non-zero rates",
                    name
                )));
            }
        }
        self.upstream.profile()?;
        self.policy
            .clone()
            .normalized()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        Ok(())
    }
}
