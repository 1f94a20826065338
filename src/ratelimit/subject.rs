//! Subjects and their store key layout.

use std::fmt;

use serde::Serialize;

use super::tier::TimeWindow;
use crate::error::{Result, TollgateError};

/// Longest identifier accepted as part of a store key.
const MAX_SUBJECT_LEN: usize = 256;

/// What kind of entity a subject identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// Unauthenticated caller, identified by client address
    Anonymous,
    /// Authenticated user without an API key
    User,
    /// Issued API key
    ApiKey,
    /// The shared client of a rate-limited upstream dependency
    Upstream,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Anonymous => "anon",
            SubjectKind::User => "user",
            SubjectKind::ApiKey => "apikey",
            SubjectKind::Upstream => "upstream",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies who is being limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Subject {
    /// The subject kind
    pub kind: SubjectKind,
    /// Opaque identifier supplied by the caller
    pub id: String,
}

impl Subject {
    /// Create a subject, rejecting identifiers that cannot form a store key.
    pub fn new(kind: SubjectKind, id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(TollgateError::Validation(format!(
                "{kind} subject has an empty identifier"
            )));
        }
        if id.len() > MAX_SUBJECT_LEN {
            return Err(TollgateError::Validation(format!(
                "{kind} subject identifier exceeds {MAX_SUBJECT_LEN} bytes"
            )));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TollgateError::Validation(format!(
                "{kind} subject identifier contains whitespace or control characters"
            )));
        }
        Ok(Self { kind, id })
    }

    /// Store key for this subject's counter in `window`.
    ///
    /// Format: `{prefix}throttle:{kind}:{id}:{window}`
    pub fn window_key(&self, prefix: &str, window: TimeWindow) -> String {
        format!("{}throttle:{}:{}:{}", prefix, self.kind, self.id, window)
    }

    /// Store key for one of this subject's token buckets.
    ///
    /// Format: `{prefix}bucket:{id}:{bucket}`
    pub fn bucket_key(&self, prefix: &str, bucket: &str) -> String {
        format!("{}bucket:{}:{}", prefix, self.id, bucket)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
