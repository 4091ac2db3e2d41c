//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `UnitStatus` / `JobStatus`: lifecycle states of work units and jobs
//! - `Frontier`: the work units of one job, deduplicated by normalized URL
//! - `HostThrottle`: per-host politeness delays with an adaptive multiplier

mod frontier;
mod host_throttle;
mod unit_status;

// Re-export main types
pub use frontier::{Frontier, FrontierCounts, UnitResolution, WorkUnit};
pub use host_throttle::{HostState, HostThrottle};
pub use unit_status::{JobStatus, UnitStatus};
