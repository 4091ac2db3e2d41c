//! Crawl scheduling and unit execution
//!
//! This module contains the core crawling logic, including:
//! - The dispatch loop that round-robins ready units across jobs
//! - Unit execution (session lease, render, extract)
//! - Retry decisions with backoff as due-time events
//! - Per-job checkpoint advancement and halting on store failures

mod retry;
mod scheduler;
mod worker;

pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{JobRegistration, Scheduler};

use crate::config::{Config, ThrottleConfig};
use crate::extract::ExtractError;
use crate::renderer::RenderError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why one attempt at a unit failed; always retried within the budget
#[derive(Debug, Error)]
pub enum UnitFailure {
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
}

/// Conditions that stop a whole job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFault {
    /// The checkpoint store rejected or timed out a write; dispatch is halted
    CheckpointWriteFailure(String),

    /// Too many units failed permanently; the job is failed
    PoisonJob { failed: usize, total: usize },
}

impl fmt::Display for JobFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckpointWriteFailure(reason) => {
                write!(f, "CheckpointWriteFailure: {}", reason)
            }
            Self::PoisonJob { failed, total } => {
                write!(f, "PoisonJob: {} of {} units failed permanently", failed, total)
            }
        }
    }
}

/// Engine-wide knobs the scheduler runs with
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_workers: usize,
    pub acquire_timeout: Duration,
    pub pool_retry_delay: Duration,
    pub save_timeout: Duration,
    pub halt_probe_interval: Duration,
    pub retry: RetryPolicy,
    pub throttle: ThrottleConfig,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_workers: config.engine.max_workers as usize,
            acquire_timeout: Duration::from_millis(config.engine.acquire_timeout_ms),
            pool_retry_delay: Duration::from_millis(config.engine.pool_retry_delay_ms),
            save_timeout: Duration::from_millis(config.checkpoint.save_timeout_ms),
            halt_probe_interval: Duration::from_millis(config.engine.halt_probe_interval_ms),
            retry: RetryPolicy::from_config(&config.retry),
            throttle: config.throttle.clone(),
        }
    }
}
