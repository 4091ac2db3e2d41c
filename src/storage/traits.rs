//! Storage traits and error types
//!
//! This module defines the interface every checkpoint backend implements and
//! the progression rules all of them enforce on writes.

use crate::job::{ExtractionRecord, JobId};
use crate::state::UnitStatus;
use crate::storage::{Checkpoint, RecordCursor, RecordPage};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("No checkpoint for job {0}")]
    NotFound(JobId),

    #[error("Stale checkpoint for job {job}: sequence {attempted} is not above stored {stored}")]
    StaleSequence {
        job: JobId,
        stored: u64,
        attempted: u64,
    },

    #[error("Checkpoint for job {job} drops completed unit {unit}")]
    Regression { job: JobId, unit: u32 },

    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable mapping from job id to its latest checkpoint and extraction records
///
/// Implementations are shared between tasks and must be safe to call from
/// blocking threads concurrently. Writes for different jobs never interfere;
/// callers serialize writes for a single job.
pub trait CheckpointStore: Send + Sync {
    /// Atomically persists a checkpoint together with the records it covers
    ///
    /// The write is all-or-nothing: either the new checkpoint and every
    /// record are visible afterwards, or nothing changed. Records already
    /// stored under the same `(job_id, unit_id, ordinal)` are kept as-is.
    ///
    /// # Errors
    ///
    /// * `StaleSequence` - The sequence is not above the stored one
    /// * `Regression` - A unit stored as done is not done in the new checkpoint
    fn commit(&self, checkpoint: &Checkpoint, records: &[ExtractionRecord]) -> StorageResult<()>;

    /// Persists a checkpoint that carries no new records
    fn save(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        self.commit(checkpoint, &[])
    }

    /// Loads the latest checkpoint of a job
    ///
    /// # Errors
    ///
    /// * `NotFound` - No checkpoint exists for the job
    fn load(&self, job_id: &JobId) -> StorageResult<Checkpoint>;

    /// Returns the latest checkpoint of every job that has not reached a terminal status
    fn list_incomplete(&self) -> StorageResult<Vec<Checkpoint>>;

    /// Returns the latest checkpoint of every job, newest first
    fn list_jobs(&self) -> StorageResult<Vec<Checkpoint>>;

    /// Pages through a job's extraction records in write order
    ///
    /// # Arguments
    ///
    /// * `job_id` - The job whose records to read
    /// * `cursor` - Position returned by a previous page, or `None` to start
    /// * `limit` - Maximum number of records in the page
    fn records(
        &self,
        job_id: &JobId,
        cursor: Option<RecordCursor>,
        limit: usize,
    ) -> StorageResult<RecordPage>;

    /// Deletes terminal jobs, with their records, last saved before `cutoff`
    ///
    /// # Returns
    ///
    /// The number of jobs removed.
    fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

/// Checks that `next` may replace `previous` as a job's latest checkpoint
pub fn check_progression(previous: Option<&Checkpoint>, next: &Checkpoint) -> StorageResult<()> {
    let Some(previous) = previous else {
        return Ok(());
    };

    if next.sequence <= previous.sequence {
        return Err(StorageError::StaleSequence {
            job: next.job_id,
            stored: previous.sequence,
            attempted: next.sequence,
        });
    }

    for unit in previous.units.iter().filter(|u| u.status == UnitStatus::Done) {
        let still_done = next
            .units
            .get(unit.id as usize)
            .is_some_and(|u| u.id == unit.id && u.status == UnitStatus::Done);
        if !still_done {
            return Err(StorageError::Regression {
                job: next.job_id,
                unit: unit.id,
            });
        }
    }

    Ok(())
}
