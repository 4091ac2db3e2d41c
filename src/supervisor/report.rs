use crate::job::JobId;
use crate::state::{JobStatus, UnitStatus, WorkUnit};
use crate::storage::Checkpoint;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A unit that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub id: u32,
    pub url: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl From<&WorkUnit> for FailedUnit {
    fn from(unit: &WorkUnit) -> Self {
        Self {
            id: unit.id,
            url: unit.url.clone(),
            attempts: unit.attempts,
            last_error: unit.last_error.clone(),
        }
    }
}

/// Point-in-time view of a job's progress
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub rule: String,
    pub status: JobStatus,
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,

    /// Set while dispatch is halted because checkpoints cannot be written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_reason: Option<String>,

    /// Why the job ended `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Cancellation requested, in-flight units still draining
    pub cancelling: bool,

    pub failed_units: Vec<FailedUnit>,
}

impl JobReport {
    /// Builds a report for a job that is only known to the store
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let count = |status: UnitStatus| {
            checkpoint
                .units
                .iter()
                .filter(|u| u.status == status)
                .count()
        };

        // In-progress snapshots never committed; they count as pending
        let pending = count(UnitStatus::Unvisited) + count(UnitStatus::InProgress);

        Self {
            job_id: checkpoint.job_id,
            rule: checkpoint.spec.rule.clone(),
            status: checkpoint.status,
            done: checkpoint.done_count(),
            failed: checkpoint.failed_count(),
            pending,
            in_flight: 0,
            total: checkpoint.units.len(),
            created_at: checkpoint.created_at,
            last_checkpoint_at: Some(checkpoint.saved_at),
            halted_reason: None,
            failure_reason: None,
            cancelling: checkpoint.cancel_requested && !checkpoint.status.is_terminal(),
            failed_units: checkpoint
                .units
                .iter()
                .filter(|u| u.status == UnitStatus::FailedPermanent)
                .map(FailedUnit::from)
                .collect(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
