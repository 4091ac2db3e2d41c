//! Execution of a single dispatched unit
//!
//! A worker leases a session, renders the page under the unit timeout,
//! returns the session to the pool and runs extraction. It never touches job
//! state; the scheduler applies the outcome.

use crate::crawler::{SchedulerSettings, UnitFailure};
use crate::extract::{Extraction, ExtractionPipeline, ResolvedRule};
use crate::job::JobId;
use crate::pool::{PoolError, SessionPool};
use crate::renderer::{RenderError, RenderRequest};
use std::sync::Arc;
use std::time::Duration;

/// A unit handed from the dispatch loop to a worker
#[derive(Debug, Clone)]
pub(crate) struct Assignment {
    pub job_id: JobId,
    pub unit_id: u32,
    pub url: String,
    pub host: String,
    pub expected_selector: Option<String>,
    pub timeout: Duration,
    pub retry_budget: u32,
    pub rule: Arc<ResolvedRule>,

    /// Attempts made before this one
    pub attempts: u32,
}

#[derive(Debug)]
pub(crate) enum WorkOutcome {
    Extracted(Extraction),
    Failed(UnitFailure),
    /// No session could be leased; the unit goes back without an attempt charge
    NoSession,
}

pub(crate) async fn run(
    pool: &SessionPool,
    pipeline: &ExtractionPipeline,
    settings: &SchedulerSettings,
    assignment: &Assignment,
) -> WorkOutcome {
    let owner = format!("{}#{}", assignment.job_id, assignment.unit_id);

    let mut lease = match pool.acquire(&owner, settings.acquire_timeout).await {
        Ok(lease) => lease,
        Err(PoolError::Exhausted { .. }) | Err(PoolError::ShutDown) => {
            tracing::debug!("No session for {}, requeueing", owner);
            return WorkOutcome::NoSession;
        }
        Err(PoolError::Open(e)) => return WorkOutcome::Failed(UnitFailure::Render(e)),
    };

    let request = RenderRequest {
        url: assignment.url.clone(),
        expected_selector: assignment.expected_selector.clone(),
        timeout: assignment.timeout,
    };

    tracing::debug!("Rendering {} ({})", assignment.url, owner);
    let rendered = match tokio::time::timeout(request.timeout, lease.render(&request)).await {
        Ok(result) => result,
        Err(_) => Err(RenderError::Timeout(request.timeout)),
    };

    let output = match rendered {
        Ok(output) => {
            pool.release(lease);
            output
        }
        Err(e) => {
            if e.is_session_fault() {
                pool.recycle(lease).await;
            } else {
                pool.release(lease);
            }
            return WorkOutcome::Failed(UnitFailure::Render(e));
        }
    };

    match pipeline.extract(&output, &assignment.rule) {
        Ok(extraction) => WorkOutcome::Extracted(extraction),
        Err(e) => WorkOutcome::Failed(UnitFailure::Extraction(e)),
    }
}
