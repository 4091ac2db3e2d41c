//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the checkpoint database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Latest checkpoint per job; older sequences are deleted in the same transaction
CREATE TABLE IF NOT EXISTS checkpoints (
    job_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    status TEXT NOT NULL,
    spec_json TEXT NOT NULL,
    units_json TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    saved_at TEXT NOT NULL,
    PRIMARY KEY (job_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);
CREATE INDEX IF NOT EXISTS idx_checkpoints_saved_at ON checkpoints(saved_at);

-- Extraction output, immutable once written
CREATE TABLE IF NOT EXISTS extraction_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    unit_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    payload TEXT NOT NULL,
    extracted_at TEXT NOT NULL,
    UNIQUE(job_id, unit_id, ordinal)
);

CREATE INDEX IF NOT EXISTS idx_records_job ON extraction_records(job_id, id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Version stamped into `PRAGMA user_version`
pub const SCHEMA_VERSION: u32 = 1;
