//! Job identifiers, submissions and extraction records

mod spec;

pub use spec::{JobConstraints, JobRequest, JobSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Opaque, unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| JobError::InvalidId(s.to_string()))
    }
}

/// Reasons a submission is refused
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job has no URLs to crawl")]
    EmptyFrontier,

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),

    #[error("unknown extraction rule '{0}'")]
    UnknownRule(String),

    #[error("malformed job file: {0}")]
    Malformed(String),

    #[error("cannot read job file {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("invalid job id '{0}'")]
    InvalidId(String),
}

/// One structured record produced from a rendered unit
///
/// Records are immutable once written; `(job_id, unit_id, ordinal)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub job_id: JobId,
    pub unit_id: u32,

    /// Position of the record within its unit's output
    pub ordinal: u32,

    pub payload: serde_json::Value,
    pub extracted_at: DateTime<Utc>,
}
