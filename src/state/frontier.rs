//! The set of work units that make up a job
//!
//! Unit ids are dense indexes into the frontier, assigned in insertion order.
//! Seeds are deduplicated by their normalized URL, and so are links
//! discovered later, so a page never enters the same job twice.

use crate::state::UnitStatus;
use crate::url::normalize_url;
use crate::{CrawlError, UrlResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use url::Url;

/// One page of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: u32,

    /// URL handed to the renderer, as submitted or discovered
    pub url: String,

    /// Selector the renderer waits for before the page counts as loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_selector: Option<String>,

    /// Render attempts made so far
    pub attempts: u32,

    pub status: UnitStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// How a finished attempt changes its unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitResolution {
    /// Extraction succeeded; `discovered` links may extend the frontier
    Done { discovered: Vec<Url> },
    /// Attempt failed and the unit goes back for another try
    Retry { error: String },
    /// Attempt failed and the retry budget is spent
    Exhausted { error: String },
}

/// Per-status unit counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontierCounts {
    pub total: usize,
    pub unvisited: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

/// The work units of one job plus the keys used to deduplicate them
#[derive(Debug, Clone)]
pub struct Frontier {
    units: Vec<WorkUnit>,
    keys: HashSet<String>,
    max_units: usize,
}

impl Frontier {
    /// Builds a fresh frontier from seed URLs
    ///
    /// # Arguments
    ///
    /// * `seeds` - Seed URLs in submission order; duplicates are dropped
    /// * `expected_selector` - Readiness selector copied onto every unit
    /// * `max_units` - Cap on the number of units, seeds included
    ///
    /// # Returns
    ///
    /// * `Ok(Frontier)` - Frontier with every unit `unvisited`
    /// * `Err(UrlError)` - A seed is not a valid HTTP(S) URL
    pub fn from_seeds(
        seeds: &[String],
        expected_selector: Option<&str>,
        max_units: usize,
    ) -> UrlResult<Self> {
        let mut frontier = Self {
            units: Vec::new(),
            keys: HashSet::new(),
            max_units,
        };

        for seed in seeds {
            let key = normalize_url(seed)?.to_string();
            if frontier.units.len() >= max_units {
                break;
            }
            if frontier.keys.insert(key) {
                frontier.push_unit(seed.trim().to_string(), expected_selector.map(str::to_string));
            }
        }

        Ok(frontier)
    }

    /// Rebuilds a frontier from a persisted snapshot
    ///
    /// Units persisted as `in_progress` were in flight when the snapshot was
    /// taken and never committed, so they come back as `unvisited`.
    pub fn from_snapshot(units: Vec<WorkUnit>, max_units: usize) -> Self {
        let mut frontier = Self {
            units: Vec::with_capacity(units.len()),
            keys: HashSet::new(),
            max_units,
        };

        for mut unit in units {
            if unit.status == UnitStatus::InProgress {
                unit.status = UnitStatus::Unvisited;
            }
            frontier.keys.insert(unit_key(&unit.url));
            frontier.units.push(unit);
        }

        frontier
    }

    fn push_unit(&mut self, url: String, expected_selector: Option<String>) -> u32 {
        let id = self.units.len() as u32;
        self.units.push(WorkUnit {
            id,
            url,
            expected_selector,
            attempts: 0,
            status: UnitStatus::Unvisited,
            last_error: None,
        });
        id
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn get(&self, id: u32) -> Option<&WorkUnit> {
        self.units.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn max_units(&self) -> usize {
        self.max_units
    }

    /// Moves a unit to `to`, rejecting illegal transitions
    pub fn transition(&mut self, id: u32, to: UnitStatus) -> Result<&mut WorkUnit, CrawlError> {
        let unit = self
            .units
            .get_mut(id as usize)
            .ok_or(CrawlError::UnknownUnit(id))?;

        if !unit.status.can_transition_to(to) {
            return Err(CrawlError::InvalidTransition {
                from: unit.status,
                to,
            });
        }

        unit.status = to;
        Ok(unit)
    }

    /// Marks an `unvisited` unit as leased to a worker
    pub fn begin(&mut self, id: u32) -> Result<&WorkUnit, CrawlError> {
        self.transition(id, UnitStatus::InProgress).map(|unit| &*unit)
    }

    /// Returns an in-flight unit to `unvisited` without charging an attempt
    pub fn revert(&mut self, id: u32) -> Result<(), CrawlError> {
        self.transition(id, UnitStatus::Unvisited).map(|_| ())
    }

    /// Applies the outcome of an attempt to an in-flight unit
    ///
    /// # Returns
    ///
    /// Ids of units appended to the frontier from discovered links.
    pub fn apply(&mut self, id: u32, resolution: &UnitResolution) -> Result<Vec<u32>, CrawlError> {
        let (next, error) = match resolution {
            UnitResolution::Done { .. } => (UnitStatus::Done, None),
            UnitResolution::Retry { error } => (UnitStatus::Unvisited, Some(error.clone())),
            UnitResolution::Exhausted { error } => {
                (UnitStatus::FailedPermanent, Some(error.clone()))
            }
        };

        let unit = self.transition(id, next)?;
        unit.attempts += 1;
        if error.is_some() {
            unit.last_error = error;
        }
        let selector = unit.expected_selector.clone();

        let mut added = Vec::new();
        if let UnitResolution::Done { discovered } = resolution {
            for link in discovered {
                if let Some(new_id) = self.push_discovered(link, selector.clone()) {
                    added.push(new_id);
                }
            }
        }

        Ok(added)
    }

    /// Appends a discovered link unless it is already known or the frontier is full
    pub fn push_discovered(&mut self, url: &Url, expected_selector: Option<String>) -> Option<u32> {
        if self.units.len() >= self.max_units {
            return None;
        }

        let key = unit_key(url.as_str());
        if !self.keys.insert(key) {
            return None;
        }

        Some(self.push_unit(url.to_string(), expected_selector))
    }

    /// Pulls in progress that reached the store but not this frontier
    ///
    /// Used after a checkpoint write whose outcome was unknown: any unit the
    /// stored snapshot shows as terminal while it is `unvisited` here is
    /// taken over, and units only the snapshot knows about are appended.
    ///
    /// # Returns
    ///
    /// The number of units changed or added.
    pub fn absorb(&mut self, stored: &[WorkUnit]) -> usize {
        let mut changed = 0;

        for theirs in stored {
            let known = self.units.len();
            match self.units.get_mut(theirs.id as usize) {
                Some(ours) => {
                    if theirs.status.is_terminal() && ours.status == UnitStatus::Unvisited {
                        ours.status = theirs.status;
                        ours.attempts = ours.attempts.max(theirs.attempts);
                        ours.last_error = theirs.last_error.clone();
                        changed += 1;
                    }
                }
                None if theirs.id as usize == known => {
                    let mut unit = theirs.clone();
                    if unit.status == UnitStatus::InProgress {
                        unit.status = UnitStatus::Unvisited;
                    }
                    self.keys.insert(unit_key(&unit.url));
                    self.units.push(unit);
                    changed += 1;
                }
                None => {
                    tracing::warn!(
                        "Ignoring stored unit {} beyond frontier of {} units",
                        theirs.id,
                        known
                    );
                }
            }
        }

        changed
    }

    /// Ids of units waiting for dispatch, in id order
    pub fn pending_ids(&self) -> Vec<u32> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Unvisited)
            .map(|u| u.id)
            .collect()
    }

    pub fn done_ids(&self) -> BTreeSet<u32> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Done)
            .map(|u| u.id)
            .collect()
    }

    pub fn failed_units(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::FailedPermanent)
    }

    pub fn counts(&self) -> FrontierCounts {
        let mut counts = FrontierCounts {
            total: self.units.len(),
            ..FrontierCounts::default()
        };
        for unit in &self.units {
            match unit.status {
                UnitStatus::Unvisited => counts.unvisited += 1,
                UnitStatus::InProgress => counts.in_progress += 1,
                UnitStatus::Done => counts.done += 1,
                UnitStatus::FailedPermanent => counts.failed += 1,
            }
        }
        counts
    }

    /// Returns true once every unit is `done` or `failed_permanent`
    pub fn all_terminal(&self) -> bool {
        self.units.iter().all(|u| u.status.is_terminal())
    }

    /// Returns true if the permanently failed fraction is strictly above `threshold`
    pub fn is_poisoned(&self, threshold: f64) -> bool {
        let counts = self.counts();
        counts.total > 0 && (counts.failed as f64 / counts.total as f64) > threshold
    }
}

/// Dedup key for a unit URL; unparseable URLs key on their raw text
fn unit_key(url: &str) -> String {
    normalize_url(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}
