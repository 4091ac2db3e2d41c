//! SQLite storage implementation
//!
//! This module provides the durable `CheckpointStore`. Every commit runs in a
//! single immediate transaction so a checkpoint and the records it covers
//! become visible together or not at all.

use crate::job::{ExtractionRecord, JobId, JobSpec};
use crate::state::{JobStatus, WorkUnit};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{check_progression, CheckpointStore, StorageError, StorageResult};
use crate::storage::{Checkpoint, RecordCursor, RecordPage};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const CHECKPOINT_COLUMNS: &str =
    "job_id, sequence, status, spec_json, units_json, cancel_requested, created_at, saved_at";

/// SQLite checkpoint store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the checkpoint database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // A checkpoint only counts once it is on disk
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;
        tracing::debug!("Opened checkpoint database at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_job_id(raw: &str) -> StorageResult<JobId> {
    raw.parse()
        .map_err(|_| StorageError::Corrupt(format!("bad job id '{}'", raw)))
}

/// Raw checkpoint columns, decoded outside the rusqlite row callback
struct CheckpointRow {
    job_id: String,
    sequence: i64,
    status: String,
    spec: String,
    units: String,
    cancel_requested: bool,
    created_at: String,
    saved_at: String,
}

impl CheckpointRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            sequence: row.get(1)?,
            status: row.get(2)?,
            spec: row.get(3)?,
            units: row.get(4)?,
            cancel_requested: row.get(5)?,
            created_at: row.get(6)?,
            saved_at: row.get(7)?,
        })
    }

    fn decode(self) -> StorageResult<Checkpoint> {
        let status = JobStatus::from_db_string(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("bad job status '{}'", self.status)))?;
        let spec: JobSpec = serde_json::from_str(&self.spec)?;
        let units: Vec<WorkUnit> = serde_json::from_str(&self.units)?;

        Ok(Checkpoint {
            job_id: parse_job_id(&self.job_id)?,
            sequence: self.sequence as u64,
            status,
            spec,
            units,
            cancel_requested: self.cancel_requested,
            created_at: parse_timestamp(&self.created_at)?,
            saved_at: parse_timestamp(&self.saved_at)?,
        })
    }
}

fn latest_checkpoint(conn: &Connection, job_id: &JobId) -> StorageResult<Option<Checkpoint>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM checkpoints WHERE job_id = ?1 ORDER BY sequence DESC LIMIT 1",
                CHECKPOINT_COLUMNS
            ),
            params![job_id.to_string()],
            CheckpointRow::read,
        )
        .optional()?;

    row.map(CheckpointRow::decode).transpose()
}

fn query_checkpoints(conn: &Connection, sql: &str) -> StorageResult<Vec<Checkpoint>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], CheckpointRow::read)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(CheckpointRow::decode).collect()
}

impl CheckpointStore for SqliteStore {
    fn commit(&self, checkpoint: &Checkpoint, records: &[ExtractionRecord]) -> StorageResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = latest_checkpoint(&tx, &checkpoint.job_id)?;
        check_progression(previous.as_ref(), checkpoint)?;

        let job_id = checkpoint.job_id.to_string();
        tx.execute(
            &format!(
                "INSERT INTO checkpoints ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                CHECKPOINT_COLUMNS
            ),
            params![
                job_id,
                checkpoint.sequence as i64,
                checkpoint.status.to_db_string(),
                serde_json::to_string(&checkpoint.spec)?,
                serde_json::to_string(&checkpoint.units)?,
                checkpoint.cancel_requested,
                timestamp(&checkpoint.created_at),
                timestamp(&checkpoint.saved_at),
            ],
        )?;

        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO extraction_records
                    (job_id, unit_id, ordinal, payload, extracted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in records {
                insert.execute(params![
                    record.job_id.to_string(),
                    record.unit_id,
                    record.ordinal,
                    serde_json::to_string(&record.payload)?,
                    timestamp(&record.extracted_at),
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM checkpoints WHERE job_id = ?1 AND sequence < ?2",
            params![job_id, checkpoint.sequence as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load(&self, job_id: &JobId) -> StorageResult<Checkpoint> {
        let conn = self.lock();
        latest_checkpoint(&conn, job_id)?.ok_or(StorageError::NotFound(*job_id))
    }

    fn list_incomplete(&self) -> StorageResult<Vec<Checkpoint>> {
        let conn = self.lock();
        query_checkpoints(
            &conn,
            &format!(
                "SELECT {} FROM checkpoints WHERE status IN ('{}', '{}') ORDER BY created_at",
                CHECKPOINT_COLUMNS,
                JobStatus::Pending.to_db_string(),
                JobStatus::Running.to_db_string()
            ),
        )
    }

    fn list_jobs(&self) -> StorageResult<Vec<Checkpoint>> {
        let conn = self.lock();
        query_checkpoints(
            &conn,
            &format!(
                "SELECT {} FROM checkpoints ORDER BY created_at DESC",
                CHECKPOINT_COLUMNS
            ),
        )
    }

    fn records(
        &self,
        job_id: &JobId,
        cursor: Option<RecordCursor>,
        limit: usize,
    ) -> StorageResult<RecordPage> {
        let conn = self.lock();
        // One extra row is fetched to detect a following page; SQLite takes the limit as i64
        let limit = limit.clamp(1, i64::MAX as usize - 1);
        let after = cursor.map(|c| c.position()).unwrap_or(0);

        let mut stmt = conn.prepare_cached(
            "SELECT id, unit_id, ordinal, payload, extracted_at
             FROM extraction_records
             WHERE job_id = ?1 AND id > ?2
             ORDER BY id
             LIMIT ?3",
        )?;

        let rows = stmt
            .query_map(
                params![job_id.to_string(), after, (limit + 1) as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = rows.len() > limit;
        let mut records = Vec::with_capacity(rows.len().min(limit));
        let mut last_position = after;

        for (position, unit_id, ordinal, payload, extracted_at) in rows.into_iter().take(limit) {
            records.push(ExtractionRecord {
                job_id: *job_id,
                unit_id,
                ordinal,
                payload: serde_json::from_str(&payload)?,
                extracted_at: parse_timestamp(&extracted_at)?,
            });
            last_position = position;
        }

        Ok(RecordPage {
            records,
            next_cursor: has_more.then(|| RecordCursor::new(last_position)),
        })
    }

    fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT job_id FROM checkpoints WHERE status IN ('{}', '{}', '{}') AND saved_at < ?1",
                JobStatus::Completed.to_db_string(),
                JobStatus::Failed.to_db_string(),
                JobStatus::Cancelled.to_db_string()
            ))?;
            let ids = stmt
                .query_map(params![timestamp(&cutoff)], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for job_id in &expired {
            tx.execute(
                "DELETE FROM extraction_records WHERE job_id = ?1",
                params![job_id],
            )?;
            tx.execute("DELETE FROM checkpoints WHERE job_id = ?1", params![job_id])?;
        }

        tx.commit()?;
        Ok(expired.len())
    }
}
