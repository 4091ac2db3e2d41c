/// Status definitions for work units and jobs
///
/// Both enums persist as short snake_case strings, in checkpoint rows and in
/// the serialized unit snapshots.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents where a single work unit is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Waiting to be dispatched (first attempt or retry)
    Unvisited,

    /// Leased to a worker; persisted snapshots treat it as unvisited
    InProgress,

    /// Rendered, extracted and checkpointed
    Done,

    /// Retry budget exhausted
    FailedPermanent,
}

impl UnitStatus {
    /// Returns true if no further work will happen on the unit
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::FailedPermanent)
    }

    /// Returns true if moving from `self` to `next` is a legal transition
    ///
    /// `unvisited -> in_progress -> {done, unvisited, failed_permanent}`.
    /// Terminal units never move again.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (Self::Unvisited, Self::InProgress)
                | (Self::InProgress, Self::Done)
                | (Self::InProgress, Self::Unvisited)
                | (Self::InProgress, Self::FailedPermanent)
        )
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Unvisited => "unvisited",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "unvisited" => Some(Self::Unvisited),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }

    /// Returns all possible unit states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Unvisited,
            Self::InProgress,
            Self::Done,
            Self::FailedPermanent,
        ]
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Represents the lifecycle of a whole job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and checkpointed, not yet picked up by the scheduler
    Pending,
    Running,
    /// Every unit is done or permanently failed
    Completed,
    /// Poisoned: too many units failed permanently
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Running,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
        ]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
