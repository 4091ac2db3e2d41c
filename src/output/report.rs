//! Human-readable job reports

use crate::supervisor::JobReport;

fn percentage(part: usize, total: usize) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

/// Formats one job's progress for the terminal
///
/// # Arguments
///
/// * `report` - The job's status report
///
/// # Returns
///
/// A multi-line summary, ending with the permanently failed units if any
pub fn format_report(report: &JobReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== Job {} ===\n\n", report.job_id));
    out.push_str(&format!("  Rule: {}\n", report.rule));
    out.push_str(&format!("  Status: {}", report.status));
    if report.cancelling {
        out.push_str(" (cancelling)");
    }
    out.push('\n');
    out.push_str(&format!("  Created: {}\n", report.created_at.to_rfc3339()));
    match report.last_checkpoint_at {
        Some(at) => out.push_str(&format!("  Last checkpoint: {}\n", at.to_rfc3339())),
        None => out.push_str("  Last checkpoint: never\n"),
    }
    out.push('\n');

    out.push_str("Units:\n");
    out.push_str(&format!(
        "  Done: {} ({:.1}%)\n",
        report.done,
        percentage(report.done, report.total)
    ));
    out.push_str(&format!(
        "  Failed: {} ({:.1}%)\n",
        report.failed,
        percentage(report.failed, report.total)
    ));
    out.push_str(&format!("  Pending: {}\n", report.pending));
    if report.in_flight > 0 {
        out.push_str(&format!("  In flight: {}\n", report.in_flight));
    }
    out.push_str(&format!("  Total: {}\n", report.total));

    if let Some(reason) = &report.halted_reason {
        out.push_str(&format!("\nHalted: {}\n", reason));
    }
    if let Some(reason) = &report.failure_reason {
        out.push_str(&format!("\nFailure: {}\n", reason));
    }

    if !report.failed_units.is_empty() {
        out.push_str(&format!("\nFailed Units ({}):\n", report.failed_units.len()));
        for unit in &report.failed_units {
            out.push_str(&format!(
                "  - [{}] {} after {} attempts: {}\n",
                unit.id,
                unit.url,
                unit.attempts,
                unit.last_error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    out
}

/// Prints one job's progress to stdout
pub fn print_report(report: &JobReport) {
    println!("{}", format_report(report));
}

/// One line per job, newest first as given
pub fn format_job_list(reports: &[JobReport]) -> String {
    if reports.is_empty() {
        return "No jobs found\n".to_string();
    }

    let mut out = String::new();
    for report in reports {
        out.push_str(&format!(
            "{}  {:<9}  {:>5}/{:<5} done  {:>4} failed  {}  {}\n",
            report.job_id,
            report.status.to_string(),
            report.done,
            report.total,
            report.failed,
            report.rule,
            report.created_at.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

pub fn print_job_list(reports: &[JobReport]) {
    print!("{}", format_job_list(reports));
}
