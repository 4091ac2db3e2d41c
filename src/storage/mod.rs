//! Storage module for persisting job checkpoints and extraction records
//!
//! This module handles:
//! - SQLite schema management and the durable checkpoint store
//! - An in-memory store used when checkpointing is disabled
//! - The progression rules (strictly increasing sequence, no lost done units)
//! - Cursor-based paging of extraction records

mod memory;
mod schema;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{check_progression, CheckpointStore, StorageError, StorageResult};

use crate::config::CheckpointConfig;
use crate::job::{ExtractionRecord, JobId, JobSpec};
use crate::state::{JobStatus, UnitStatus, WorkUnit};
use crate::CrawlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Opens the checkpoint store the configuration asks for
///
/// # Arguments
///
/// * `config` - The checkpoint configuration section
///
/// # Returns
///
/// * `Ok(store)` - SQLite store when checkpointing is enabled, memory store otherwise
/// * `Err(CrawlError)` - The database could not be opened
pub fn open_store(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>, CrawlError> {
    if config.enabled {
        let store = SqliteStore::open(Path::new(&config.database_path))?;
        Ok(Arc::new(store))
    } else {
        tracing::warn!("Checkpointing disabled: jobs will restart from scratch after a crash");
        Ok(Arc::new(MemoryStore::new()))
    }
}

/// A durable snapshot of one job's progress
///
/// Only the checkpoint with the highest sequence for a job is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,

    /// Strictly increasing per job
    pub sequence: u64,

    pub status: JobStatus,

    pub spec: JobSpec,

    /// Every unit of the frontier, indexed by unit id
    pub units: Vec<WorkUnit>,

    /// Cancellation was requested and the job is draining
    #[serde(default)]
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn done_count(&self) -> usize {
        self.count(UnitStatus::Done)
    }

    pub fn failed_count(&self) -> usize {
        self.count(UnitStatus::FailedPermanent)
    }

    fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }
}

/// Restartable position in a job's record stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordCursor(i64);

impl RecordCursor {
    pub(crate) fn new(position: i64) -> Self {
        Self(position)
    }

    pub(crate) fn position(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecordCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordCursor {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|_| StorageError::Corrupt(format!("invalid record cursor '{}'", s)))
    }
}

/// One page of extraction records
#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub records: Vec<ExtractionRecord>,

    /// Cursor for the following page; `None` once the stream is exhausted
    pub next_cursor: Option<RecordCursor>,
}
