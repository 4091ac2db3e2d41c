//! Output module for job reports and exports
//!
//! This module handles:
//! - Formatting job status reports for the terminal
//! - Exporting a job's records and failed units as JSON

mod export;
mod report;

pub use export::{collect_export, write_export, JobExport};
pub use report::{format_job_list, format_report, print_job_list, print_report};
