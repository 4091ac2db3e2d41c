//! JSON export of a job's results

use crate::job::{ExtractionRecord, JobId};
use crate::storage::{CheckpointStore, StorageError};
use crate::supervisor::JobReport;
use crate::CrawlError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const EXPORT_PAGE_SIZE: usize = 500;

/// Everything known about a job's output
#[derive(Debug, Clone, Serialize)]
pub struct JobExport {
    pub job: JobReport,
    pub records: Vec<ExtractionRecord>,
    pub exported_at: DateTime<Utc>,
}

/// Reads a job's latest checkpoint and every one of its records
///
/// Works on the store alone, so finished jobs can be exported without
/// starting the engine.
pub fn collect_export(store: &dyn CheckpointStore, job_id: JobId) -> Result<JobExport, CrawlError> {
    let checkpoint = match store.load(&job_id) {
        Ok(checkpoint) => checkpoint,
        Err(StorageError::NotFound(_)) => return Err(CrawlError::JobNotFound(job_id)),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut cursor = None;
    loop {
        let page = store.records(&job_id, cursor, EXPORT_PAGE_SIZE)?;
        records.extend(page.records);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(JobExport {
        job: JobReport::from_checkpoint(&checkpoint),
        records,
        exported_at: Utc::now(),
    })
}

/// Writes an export as pretty-printed JSON
///
/// # Arguments
///
/// * `export` - The collected export
/// * `output_path` - Destination file; parent directories are created
///
/// # Returns
///
/// * `Ok(())` - File written
/// * `Err(CrawlError)` - The file could not be created or serialized
pub fn write_export(export: &JobExport, output_path: &Path) -> Result<(), CrawlError> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = BufWriter::new(File::create(output_path)?);
    serde_json::to_writer_pretty(&mut writer, export)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    tracing::info!(
        "Exported {} records of job {} to {}",
        export.records.len(),
        export.job.job_id,
        output_path.display()
    );
    Ok(())
}
