//! crawl-keeper: a checkpointed crawl orchestration engine
//!
//! This crate schedules page render and extraction work across a bounded pool
//! of browser sessions, persists per-job checkpoints so an interrupted crawl
//! resumes without redoing completed pages, and isolates failures of single
//! pages from the jobs they belong to.

pub mod config;
pub mod crawler;
pub mod extract;
pub mod job;
pub mod output;
pub mod pool;
pub mod renderer;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod url;

use thiserror::Error;

/// Main error type for crawl-keeper operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Session pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Render error: {0}")]
    Render(#[from] renderer::RenderError),

    #[error("Extraction error: {0}")]
    Extract(#[from] extract::ExtractError),

    #[error("Job rejected: {0}")]
    Job(#[from] job::JobError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("Invalid unit transition: {from} -> {to}")]
    InvalidTransition {
        from: state::UnitStatus,
        to: state::UnitStatus,
    },

    #[error("Job not found: {0}")]
    JobNotFound(job::JobId),

    #[error("Unknown work unit: {0}")]
    UnknownUnit(u32),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    #[error("Invalid host pattern: {0}")]
    InvalidPattern(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for crawl-keeper operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use job::{ExtractionRecord, JobId, JobRequest, JobSpec};
pub use state::{JobStatus, UnitStatus};
pub use supervisor::{JobReport, JobSupervisor, SupervisorDeps};
