//! In-memory checkpoint store
//!
//! Used when checkpointing is disabled and by tests. It enforces the same
//! progression rules as the SQLite store but loses everything on exit.

use crate::job::{ExtractionRecord, JobId};
use crate::storage::traits::{check_progression, CheckpointStore, StorageError, StorageResult};
use crate::storage::{Checkpoint, RecordCursor, RecordPage};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct MemoryState {
    checkpoints: HashMap<JobId, Checkpoint>,
    /// Stored records in write order, with their stream position
    records: Vec<(i64, ExtractionRecord)>,
    record_keys: HashSet<(JobId, u32, u32)>,
    next_position: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for MemoryStore {
    fn commit(&self, checkpoint: &Checkpoint, records: &[ExtractionRecord]) -> StorageResult<()> {
        let mut state = self.lock();
        check_progression(state.checkpoints.get(&checkpoint.job_id), checkpoint)?;

        for record in records {
            let key = (record.job_id, record.unit_id, record.ordinal);
            if state.record_keys.insert(key) {
                state.next_position += 1;
                let position = state.next_position;
                state.records.push((position, record.clone()));
            }
        }

        state
            .checkpoints
            .insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    fn load(&self, job_id: &JobId) -> StorageResult<Checkpoint> {
        self.lock()
            .checkpoints
            .get(job_id)
            .cloned()
            .ok_or(StorageError::NotFound(*job_id))
    }

    fn list_incomplete(&self) -> StorageResult<Vec<Checkpoint>> {
        let mut incomplete: Vec<_> = self
            .lock()
            .checkpoints
            .values()
            .filter(|cp| !cp.status.is_terminal())
            .cloned()
            .collect();
        incomplete.sort_by_key(|cp| cp.created_at);
        Ok(incomplete)
    }

    fn list_jobs(&self) -> StorageResult<Vec<Checkpoint>> {
        let mut jobs: Vec<_> = self.lock().checkpoints.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    fn records(
        &self,
        job_id: &JobId,
        cursor: Option<RecordCursor>,
        limit: usize,
    ) -> StorageResult<RecordPage> {
        let state = self.lock();
        let limit = limit.max(1);
        let after = cursor.map(|c| c.position()).unwrap_or(0);

        let mut matching = state
            .records
            .iter()
            .filter(|(position, record)| *position > after && record.job_id == *job_id);

        let page: Vec<_> = matching.by_ref().take(limit).collect();
        let has_more = matching.next().is_some();

        Ok(RecordPage {
            next_cursor: page
                .last()
                .filter(|_| has_more)
                .map(|(position, _)| RecordCursor::new(*position)),
            records: page.into_iter().map(|(_, r)| r.clone()).collect(),
        })
    }

    fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.lock();
        let expired: HashSet<JobId> = state
            .checkpoints
            .values()
            .filter(|cp| cp.status.is_terminal() && cp.saved_at < cutoff)
            .map(|cp| cp.job_id)
            .collect();

        state.checkpoints.retain(|id, _| !expired.contains(id));
        state.records.retain(|(_, r)| !expired.contains(&r.job_id));
        state.record_keys.retain(|(id, _, _)| !expired.contains(id));
        Ok(expired.len())
    }
}
