//! Tollgate - Distributed Quota Enforcement
//!
//! Fixed-window request quotas for an application's own endpoints and token
//! buckets protecting a shared upstream credential. All counter state lives
//! in a shared store, so any number of instances enforce one set of limits
//! without talking to each other.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::TollgateConfig;
pub use error::{Result, TollgateError};
pub use ratelimit::{AdmissionDecision, Principal, QuotaLimiter};
