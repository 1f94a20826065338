//! Quota enforcement: engines, policy resolution and admission decisions.

mod bucket;
mod decision;
mod degradation;
mod limiter;
mod policy;
mod subject;
mod tier;
mod window;

pub use bucket::{BucketCheck, NamedBucket, TokenBucketEngine, UpstreamProfile};
pub use decision::{
    AdmissionDecision, DecisionScope, DenyReason, Rejection, TierSnapshot, TOO_MANY_REQUESTS,
};
pub use degradation::{FailMode, StoreGuard, StoreState};
pub use limiter::{QuotaLimiter, UsageReport};
pub use policy::{
    ApiKeyDefaults, ApiKeyGrant, PolicyTable, Principal, QuotaPolicy, QuotaPolicyResolver,
};
pub use subject::{Subject, SubjectKind};
pub use tier::{validate_tiers, QuotaTier, TimeWindow};
pub use window::{TierCheck, WindowCounterEngine};
