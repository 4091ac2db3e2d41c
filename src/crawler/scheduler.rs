//! Scheduler for dispatching work units across jobs
//!
//! This module handles:
//! - One ready queue per job, served round-robin by a single dispatch loop
//! - A global worker limit shared by all jobs, plus each job's own cap
//! - Retries and pool-exhaustion requeues as due-time events in a min-heap
//! - Per-host politeness delays
//! - Advancing each job's checkpoint after every attempt, serialized per job
//! - Halting a job while its checkpoint cannot be written, and probing the
//!   store until it can
//!
//! Live job state sits behind one synchronous mutex that is never held across
//! an await. Checkpoint writes for a job are ordered by that job's async
//! persist lock: a snapshot is built from the live state, written, and only
//! then applied to the live state.

use crate::crawler::worker::{self, Assignment, WorkOutcome};
use crate::crawler::{JobFault, RetryDecision, SchedulerSettings};
use crate::extract::{ExtractionPipeline, ResolvedRule};
use crate::job::{ExtractionRecord, JobId, JobSpec};
use crate::pool::SessionPool;
use crate::state::{Frontier, HostThrottle, JobStatus, UnitResolution, UnitStatus};
use crate::storage::{Checkpoint, CheckpointStore, StorageError};
use crate::supervisor::{FailedUnit, JobReport};
use crate::url::extract_host;
use crate::CrawlError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// Everything the scheduler needs to run a job, new or recovered
pub struct JobRegistration {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub rule: Arc<ResolvedRule>,
    pub frontier: Frontier,

    /// Sequence of the job's latest stored checkpoint
    pub sequence: u64,

    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

/// A unit waiting for its due time before it rejoins its job's ready queue
#[derive(Debug, Clone)]
struct DelayedUnit {
    due: Instant,
    job_id: JobId,
    unit_id: u32,
}

// Reverse ordering so the BinaryHeap pops the earliest due time first
impl Ord for DelayedUnit {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.job_id.cmp(&self.job_id))
            .then_with(|| other.unit_id.cmp(&self.unit_id))
    }
}

impl PartialOrd for DelayedUnit {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DelayedUnit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for DelayedUnit {}

struct JobEntry {
    spec: JobSpec,
    rule: Arc<ResolvedRule>,
    frontier: Frontier,
    ready: VecDeque<u32>,
    in_flight: usize,

    /// Entries of this job in the delayed heap
    delayed: usize,

    status: JobStatus,
    sequence: u64,
    halted: Option<JobFault>,
    fault: Option<JobFault>,
    probing: bool,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    last_checkpoint_at: Option<DateTime<Utc>>,
    persist_lock: Arc<tokio::sync::Mutex<()>>,
    status_tx: watch::Sender<JobStatus>,
}

impl JobEntry {
    fn dispatchable(&self) -> bool {
        let constraints = &self.spec.constraints;
        self.status == JobStatus::Running
            && self.halted.is_none()
            && !self.cancel_requested
            && self.in_flight < constraints.effective_concurrency()
            && (!constraints.ordered || (self.in_flight == 0 && self.delayed == 0))
    }

    /// Queues a unit for dispatch; ordered jobs keep the queue in id order
    fn enqueue(&mut self, unit_id: u32) {
        if self.spec.constraints.ordered {
            let at = self.ready.partition_point(|id| *id < unit_id);
            self.ready.insert(at, unit_id);
        } else {
            self.ready.push_back(unit_id);
        }
    }

    fn snapshot(&self, job_id: JobId, frontier: &Frontier, status: JobStatus) -> Checkpoint {
        Checkpoint {
            job_id,
            sequence: self.sequence + 1,
            status,
            spec: self.spec.clone(),
            units: frontier.units().to_vec(),
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            saved_at: Utc::now(),
        }
    }

    fn report(&self, job_id: JobId) -> JobReport {
        let counts = self.frontier.counts();
        JobReport {
            job_id,
            rule: self.spec.rule.clone(),
            status: self.status,
            done: counts.done,
            failed: counts.failed,
            pending: counts.unvisited,
            in_flight: self.in_flight,
            total: counts.total,
            created_at: self.created_at,
            last_checkpoint_at: self.last_checkpoint_at,
            halted_reason: self.halted.as_ref().map(ToString::to_string),
            failure_reason: self.fault.as_ref().map(ToString::to_string),
            cancelling: self.cancel_requested && !self.status.is_terminal(),
            failed_units: self.frontier.failed_units().map(FailedUnit::from).collect(),
        }
    }

    /// Records a checkpoint that reached the store
    fn committed(&mut self, checkpoint: &Checkpoint) {
        self.sequence = checkpoint.sequence;
        self.last_checkpoint_at = Some(checkpoint.saved_at);
    }

    /// Marks the job halted; returns true if a probe must be started
    fn halt(&mut self, job_id: JobId, reason: String) -> bool {
        let fault = JobFault::CheckpointWriteFailure(reason);
        if self.halted.is_none() {
            tracing::error!("Job {} halted: {}", job_id, fault);
        }
        self.halted = Some(fault);

        let start_probe = !self.probing;
        self.probing = true;
        start_probe
    }
}

/// Status a job should have given its frontier
fn settle_status(current: JobStatus, frontier: &Frontier, poison_threshold: f64) -> JobStatus {
    if current.is_terminal() {
        current
    } else if frontier.is_poisoned(poison_threshold) {
        JobStatus::Failed
    } else if frontier.all_terminal() {
        JobStatus::Completed
    } else {
        JobStatus::Running
    }
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| extract_host(&u))
        .unwrap_or_default()
}

/// Moves a job to `status`, retiring it from dispatch when terminal
fn apply_status(
    job: &mut JobEntry,
    rotation: &mut VecDeque<JobId>,
    job_id: JobId,
    status: JobStatus,
) {
    if job.status == status {
        return;
    }
    job.status = status;

    if status.is_terminal() {
        job.ready.clear();
        rotation.retain(|id| *id != job_id);

        let counts = job.frontier.counts();
        if status == JobStatus::Failed {
            let fault = JobFault::PoisonJob {
                failed: counts.failed,
                total: counts.total,
            };
            tracing::error!("Job {} failed: {}", job_id, fault);
            job.fault = Some(fault);
        } else {
            tracing::info!(
                "Job {} {}: {} done, {} failed, {} total",
                job_id,
                status,
                counts.done,
                counts.failed,
                counts.total
            );
        }
    }

    job.status_tx.send_replace(status);
}

struct SchedulerState {
    jobs: HashMap<JobId, JobEntry>,
    rotation: VecDeque<JobId>,
    delayed: BinaryHeap<DelayedUnit>,
    throttle: HostThrottle,
}

enum Dispatch {
    Unit(Assignment),
    /// Nothing ready; wake up no later than the given instant
    Idle(Option<Instant>),
}

enum Pick {
    Unit(u32, String),
    Wait(Option<Instant>),
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    notify: Notify,
    workers: Arc<Semaphore>,
    pool: SessionPool,
    store: Arc<dyn CheckpointStore>,
    pipeline: ExtractionPipeline,
    settings: SchedulerSettings,
    shutdown: AtomicBool,
}

/// Handle to the dispatch loop and the live state of every job
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Creates the scheduler and spawns its dispatch loop
    ///
    /// # Arguments
    ///
    /// * `settings` - Engine-wide limits and timeouts
    /// * `pool` - The session pool workers lease from
    /// * `store` - Where checkpoints and records are committed
    pub fn start(
        settings: SchedulerSettings,
        pool: SessionPool,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedulerState {
                jobs: HashMap::new(),
                rotation: VecDeque::new(),
                delayed: BinaryHeap::new(),
                throttle: HostThrottle::new(settings.throttle.clone()),
            }),
            notify: Notify::new(),
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            pool,
            store,
            pipeline: ExtractionPipeline::new(),
            settings,
            shutdown: AtomicBool::new(false),
        });

        let handle = tokio::spawn(Arc::clone(&inner).dispatch_loop());
        Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Hands a job to the dispatch loop
    ///
    /// The job's latest checkpoint must already be stored with
    /// `registration.sequence`. Jobs with nothing left to do are finalized
    /// right away.
    pub async fn register(&self, registration: JobRegistration) -> Result<(), CrawlError> {
        if self.inner.is_shut_down() {
            return Err(CrawlError::ShuttingDown);
        }

        let job_id = registration.job_id;
        {
            let mut state = self.inner.lock_state();
            if state.jobs.contains_key(&job_id) {
                tracing::debug!("Job {} is already registered", job_id);
                return Ok(());
            }

            let (status_tx, _) = watch::channel(JobStatus::Running);
            let mut entry = JobEntry {
                spec: registration.spec,
                rule: registration.rule,
                ready: VecDeque::new(),
                in_flight: 0,
                delayed: 0,
                status: JobStatus::Running,
                sequence: registration.sequence,
                halted: None,
                fault: None,
                probing: false,
                cancel_requested: registration.cancel_requested,
                created_at: registration.created_at,
                last_checkpoint_at: registration.last_checkpoint_at,
                persist_lock: Arc::new(tokio::sync::Mutex::new(())),
                status_tx,
                frontier: registration.frontier,
            };
            if !entry.cancel_requested {
                for id in entry.frontier.pending_ids() {
                    entry.enqueue(id);
                }
            }

            tracing::info!(
                "Job {} registered: rule '{}', {} units ({} pending)",
                job_id,
                entry.spec.rule,
                entry.frontier.len(),
                entry.ready.len()
            );
            state.jobs.insert(job_id, entry);
            state.rotation.push_back(job_id);
        }

        self.inner.notify.notify_one();
        self.inner.finalize_if_settled(job_id).await;
        Ok(())
    }

    /// Stops dispatching a job's units; in-flight units finish and are checkpointed
    ///
    /// # Returns
    ///
    /// The job's status after the request: `cancelled` once nothing is in
    /// flight, otherwise `running` until the last in-flight unit lands.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, CrawlError> {
        {
            let mut state = self.inner.lock_state();
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or(CrawlError::JobNotFound(job_id))?;
            if job.status.is_terminal() {
                return Ok(job.status);
            }
            if !job.cancel_requested {
                tracing::info!(
                    "Cancelling job {}: {} units in flight, {} dropped from the queue",
                    job_id,
                    job.in_flight,
                    job.ready.len()
                );
            }
            job.cancel_requested = true;
            job.ready.clear();
        }

        self.inner.finalize_if_settled(job_id).await;
        self.status(job_id).ok_or(CrawlError::JobNotFound(job_id))
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.inner.lock_state().jobs.get(&job_id).map(|j| j.status)
    }

    pub fn report(&self, job_id: JobId) -> Option<JobReport> {
        self.inner
            .lock_state()
            .jobs
            .get(&job_id)
            .map(|job| job.report(job_id))
    }

    pub fn reports(&self) -> Vec<JobReport> {
        let state = self.inner.lock_state();
        let mut reports: Vec<_> = state.jobs.iter().map(|(id, job)| job.report(*id)).collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        reports
    }

    /// Watches a job's status transitions
    pub fn subscribe(&self, job_id: JobId) -> Option<watch::Receiver<JobStatus>> {
        self.inner
            .lock_state()
            .jobs
            .get(&job_id)
            .map(|job| job.status_tx.subscribe())
    }

    /// Drops terminal jobs last checkpointed before `cutoff` from memory
    pub fn forget_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.inner.lock_state();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.last_checkpoint_at.map_or(true, |at| at < cutoff))
        });
        before - state.jobs.len()
    }

    /// Stops dispatch and waits up to `drain_timeout` for in-flight units
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_one();

        let all = self.inner.settings.max_workers.max(1) as u32;
        match tokio::time::timeout(drain_timeout, self.inner.workers.acquire_many(all)).await {
            Ok(Ok(_permits)) => tracing::info!("Scheduler drained"),
            _ => tracing::warn!("Scheduler shut down with units still in flight"),
        }

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl SchedulerInner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn persist_lock(&self, job_id: &JobId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.lock_state()
            .jobs
            .get(job_id)
            .map(|job| Arc::clone(&job.persist_lock))
    }

    async fn dispatch_loop(self: Arc<Self>) {
        tracing::debug!("Dispatch loop started");

        loop {
            if self.is_shut_down() {
                break;
            }

            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if self.is_shut_down() {
                break;
            }

            match self.next_dispatch(Instant::now()) {
                Dispatch::Unit(assignment) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move { inner.execute(assignment, permit).await });
                }
                Dispatch::Idle(wake_at) => {
                    drop(permit);
                    match wake_at {
                        Some(due) => {
                            tokio::select! {
                                _ = self.notify.notified() => {}
                                _ = tokio::time::sleep_until(due) => {}
                            }
                        }
                        None => self.notify.notified().await,
                    }
                }
            }
        }

        tracing::debug!("Dispatch loop stopped");
    }

    /// Picks the next unit to run, round-robin across dispatchable jobs
    fn next_dispatch(&self, now: Instant) -> Dispatch {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        while state.delayed.peek().is_some_and(|top| top.due <= now) {
            let Some(due) = state.delayed.pop() else {
                break;
            };
            if let Some(job) = state.jobs.get_mut(&due.job_id) {
                job.delayed = job.delayed.saturating_sub(1);
                let waiting = job
                    .frontier
                    .get(due.unit_id)
                    .is_some_and(|u| u.status == UnitStatus::Unvisited);
                if waiting && !job.status.is_terminal() && !job.cancel_requested {
                    job.enqueue(due.unit_id);
                }
            }
        }

        let mut wake_at = state.delayed.peek().map(|d| d.due);

        for _ in 0..state.rotation.len() {
            let Some(job_id) = state.rotation.pop_front() else {
                break;
            };
            state.rotation.push_back(job_id);

            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if !job.dispatchable() {
                continue;
            }

            match pick(job, &state.throttle, now) {
                Pick::Unit(unit_id, host) => {
                    let unit = match job.frontier.begin(unit_id) {
                        Ok(unit) => unit.clone(),
                        Err(e) => {
                            tracing::warn!("Skipping unit {} of job {}: {}", unit_id, job_id, e);
                            continue;
                        }
                    };
                    job.in_flight += 1;
                    state.throttle.record_dispatch(&host, now);

                    return Dispatch::Unit(Assignment {
                        job_id,
                        unit_id,
                        url: unit.url,
                        host,
                        expected_selector: unit.expected_selector,
                        timeout: job.spec.constraints.unit_timeout(),
                        retry_budget: job.spec.constraints.retry_budget,
                        rule: Arc::clone(&job.rule),
                        attempts: unit.attempts,
                    });
                }
                Pick::Wait(Some(until)) => {
                    wake_at = Some(wake_at.map_or(until, |w| w.min(until)));
                }
                Pick::Wait(None) => {}
            }
        }

        Dispatch::Idle(wake_at)
    }

    async fn execute(self: Arc<Self>, assignment: Assignment, _permit: OwnedSemaphorePermit) {
        let outcome = worker::run(&self.pool, &self.pipeline, &self.settings, &assignment).await;
        self.complete(assignment, outcome).await;
    }

    /// Applies a worker's outcome: checkpoint first, live state second
    async fn complete(self: &Arc<Self>, a: Assignment, outcome: WorkOutcome) {
        let (resolution, records, retry_delay) = match outcome {
            WorkOutcome::NoSession => {
                self.requeue_without_charge(&a);
                self.finalize_if_settled(a.job_id).await;
                return;
            }
            WorkOutcome::Extracted(extraction) => {
                let extracted_at = Utc::now();
                let records: Vec<ExtractionRecord> = extraction
                    .payloads
                    .into_iter()
                    .enumerate()
                    .map(|(ordinal, payload)| ExtractionRecord {
                        job_id: a.job_id,
                        unit_id: a.unit_id,
                        ordinal: ordinal as u32,
                        payload,
                        extracted_at,
                    })
                    .collect();
                tracing::debug!(
                    "Unit {} of job {} extracted {} records",
                    a.unit_id,
                    a.job_id,
                    records.len()
                );
                (
                    UnitResolution::Done {
                        discovered: extraction.links,
                    },
                    records,
                    None,
                )
            }
            WorkOutcome::Failed(failure) => {
                let attempts = a.attempts + 1;
                let error = failure.to_string();
                match self.settings.retry.decide(attempts, a.retry_budget) {
                    RetryDecision::Retry { delay } => {
                        tracing::warn!(
                            "Unit {} of job {} failed (attempt {}), retrying in {:?}: {}",
                            a.unit_id,
                            a.job_id,
                            attempts,
                            delay,
                            error
                        );
                        (UnitResolution::Retry { error }, Vec::new(), Some(delay))
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!(
                            "Unit {} of job {} failed permanently after {} attempts: {}",
                            a.unit_id,
                            a.job_id,
                            attempts,
                            error
                        );
                        (UnitResolution::Exhausted { error }, Vec::new(), None)
                    }
                }
            }
        };

        let Some(lock) = self.persist_lock(&a.job_id) else {
            return;
        };
        let guard = lock.lock().await;

        let prepared = {
            let mut state = self.lock_state();
            let Some(job) = state.jobs.get_mut(&a.job_id) else {
                return;
            };
            let mut frontier = job.frontier.clone();
            match frontier.apply(a.unit_id, &resolution) {
                Ok(_) => {
                    let status = settle_status(
                        job.status,
                        &frontier,
                        job.spec.constraints.poison_threshold,
                    );
                    Some(job.snapshot(a.job_id, &frontier, status))
                }
                Err(e) => {
                    tracing::error!("Dropping outcome of unit {} of job {}: {}", a.unit_id, a.job_id, e);
                    job.in_flight = job.in_flight.saturating_sub(1);
                    None
                }
            }
        };
        let Some(checkpoint) = prepared else {
            return;
        };

        let result = self.persist(checkpoint.clone(), records).await;

        let start_probe = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(job) = state.jobs.get_mut(&a.job_id) else {
                return;
            };
            job.in_flight = job.in_flight.saturating_sub(1);

            match result {
                Ok(()) => {
                    job.committed(&checkpoint);
                    match job.frontier.apply(a.unit_id, &resolution) {
                        Ok(discovered) => {
                            if !discovered.is_empty() {
                                tracing::debug!(
                                    "Job {} grew by {} discovered units",
                                    a.job_id,
                                    discovered.len()
                                );
                            }
                            for id in discovered {
                                job.enqueue(id);
                            }
                        }
                        Err(e) => tracing::error!("Live state of job {} diverged: {}", a.job_id, e),
                    }

                    match resolution {
                        UnitResolution::Done { .. } => state.throttle.record_success(&a.host),
                        _ => state.throttle.record_error(&a.host),
                    }

                    if let Some(delay) = retry_delay {
                        if !job.cancel_requested {
                            state.delayed.push(DelayedUnit {
                                due: Instant::now() + delay,
                                job_id: a.job_id,
                                unit_id: a.unit_id,
                            });
                            job.delayed += 1;
                        }
                    }

                    let counts = job.frontier.counts();
                    if matches!(resolution, UnitResolution::Done { .. }) && counts.done % 10 == 0 {
                        tracing::info!(
                            "Job {}: {}/{} units done, {} failed",
                            a.job_id,
                            counts.done,
                            counts.total,
                            counts.failed
                        );
                    }

                    apply_status(job, &mut state.rotation, a.job_id, checkpoint.status);
                    false
                }
                Err(reason) => {
                    if let Err(e) = job.frontier.revert(a.unit_id) {
                        tracing::error!("Could not return unit {} of job {}: {}", a.unit_id, a.job_id, e);
                    }
                    job.ready.push_front(a.unit_id);
                    job.halt(a.job_id, reason)
                }
            }
        };

        drop(guard);
        self.notify.notify_one();

        if start_probe {
            tokio::spawn(Arc::clone(self).probe(a.job_id));
        }
        self.finalize_if_settled(a.job_id).await;
    }

    fn requeue_without_charge(&self, a: &Assignment) {
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if let Some(job) = state.jobs.get_mut(&a.job_id) {
                job.in_flight = job.in_flight.saturating_sub(1);
                if let Err(e) = job.frontier.revert(a.unit_id) {
                    tracing::error!("Could not requeue unit {} of job {}: {}", a.unit_id, a.job_id, e);
                } else if !job.cancel_requested && !job.status.is_terminal() {
                    state.delayed.push(DelayedUnit {
                        due: Instant::now() + self.settings.pool_retry_delay,
                        job_id: a.job_id,
                        unit_id: a.unit_id,
                    });
                    job.delayed += 1;
                }
            }
        }
        self.notify.notify_one();
    }

    /// Commits on a blocking thread, bounded by the save timeout
    async fn persist(
        &self,
        checkpoint: Checkpoint,
        records: Vec<ExtractionRecord>,
    ) -> Result<(), String> {
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || store.commit(&checkpoint, &records));

        match tokio::time::timeout(self.settings.save_timeout, task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(e)) => Err(format!("checkpoint task failed: {}", e)),
            Err(_) => Err(format!(
                "checkpoint save timed out after {:?}",
                self.settings.save_timeout
            )),
        }
    }

    /// Writes the terminal checkpoint of a job that has nothing left in flight
    async fn finalize_if_settled(self: &Arc<Self>, job_id: JobId) {
        let Some(lock) = self.persist_lock(&job_id) else {
            return;
        };
        let guard = lock.lock().await;

        let checkpoint = {
            let state = self.lock_state();
            let Some(job) = state.jobs.get(&job_id) else {
                return;
            };
            if job.status.is_terminal() || job.halted.is_some() || job.in_flight > 0 {
                return;
            }

            let status = if job.cancel_requested {
                JobStatus::Cancelled
            } else {
                settle_status(job.status, &job.frontier, job.spec.constraints.poison_threshold)
            };
            if !status.is_terminal() {
                return;
            }
            job.snapshot(job_id, &job.frontier, status)
        };

        let result = self.persist(checkpoint.clone(), Vec::new()).await;

        let start_probe = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            match result {
                Ok(()) => {
                    job.committed(&checkpoint);
                    apply_status(job, &mut state.rotation, job_id, checkpoint.status);
                    false
                }
                Err(reason) => job.halt(job_id, reason),
            }
        };

        drop(guard);
        if start_probe {
            tokio::spawn(Arc::clone(self).probe(job_id));
        }
    }

    /// Retries the store until a checkpoint of a halted job goes through
    ///
    /// Boxed because it awaits `finalize_if_settled`, which may spawn it again.
    fn probe(self: Arc<Self>, job_id: JobId) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            loop {
                tokio::time::sleep(self.settings.halt_probe_interval).await;

                let Some(lock) = self.persist_lock(&job_id) else {
                    return;
                };
                if self.is_shut_down() {
                    if let Some(job) = self.lock_state().jobs.get_mut(&job_id) {
                        job.probing = false;
                    }
                    return;
                }
                let guard = lock.lock().await;

                // A write that timed out may still have landed; take over whatever the store holds
                let store = Arc::clone(&self.store);
                let loaded = tokio::time::timeout(
                    self.settings.save_timeout,
                    tokio::task::spawn_blocking(move || store.load(&job_id)),
                )
                .await;
                match loaded {
                    Ok(Ok(Ok(stored))) => {
                        if self.absorb_stored(job_id, &stored) {
                            return;
                        }
                    }
                    Ok(Ok(Err(StorageError::NotFound(_)))) => {}
                    Ok(Ok(Err(e))) => {
                        tracing::debug!("Checkpoint store still unavailable for job {}: {}", job_id, e);
                        continue;
                    }
                    _ => {
                        tracing::debug!("Checkpoint store still unavailable for job {}", job_id);
                        continue;
                    }
                }

                let checkpoint = {
                    let mut state = self.lock_state();
                    let Some(job) = state.jobs.get_mut(&job_id) else {
                        return;
                    };
                    if job.halted.is_none() {
                        job.probing = false;
                        return;
                    }
                    let status =
                        settle_status(job.status, &job.frontier, job.spec.constraints.poison_threshold);
                    job.snapshot(job_id, &job.frontier, status)
                };

                match self.persist(checkpoint.clone(), Vec::new()).await {
                    Ok(()) => {
                        {
                            let mut guard = self.lock_state();
                            let state = &mut *guard;
                            let Some(job) = state.jobs.get_mut(&job_id) else {
                                return;
                            };
                            job.committed(&checkpoint);
                            job.halted = None;
                            job.probing = false;
                            apply_status(job, &mut state.rotation, job_id, checkpoint.status);
                            tracing::info!(
                                "Job {} resumed: checkpoint store accepted sequence {}",
                                job_id,
                                checkpoint.sequence
                            );
                        }
                        drop(guard);
                        self.notify.notify_one();
                        self.finalize_if_settled(job_id).await;
                        return;
                    }
                    Err(reason) => {
                        tracing::warn!("Checkpoint probe for job {} failed: {}", job_id, reason);
                        if let Some(job) = self.lock_state().jobs.get_mut(&job_id) {
                            job.halted = Some(JobFault::CheckpointWriteFailure(reason));
                        }
                    }
                }
            }
        })
    }

    /// Merges a stored checkpoint that is ahead of the live state
    ///
    /// # Returns
    ///
    /// True if the stored checkpoint was terminal and the job is now settled.
    fn absorb_stored(&self, job_id: JobId, stored: &Checkpoint) -> bool {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return true;
        };
        if stored.sequence <= job.sequence {
            return false;
        }

        let known = job.frontier.len() as u32;
        let changed = job.frontier.absorb(&stored.units);
        job.committed(stored);
        for id in known..job.frontier.len() as u32 {
            if !job.cancel_requested
                && job
                    .frontier
                    .get(id)
                    .is_some_and(|u| u.status == UnitStatus::Unvisited)
            {
                job.enqueue(id);
            }
        }
        tracing::info!(
            "Job {} caught up with stored checkpoint {} ({} units updated)",
            job_id,
            stored.sequence,
            changed
        );

        if stored.status.is_terminal() {
            job.halted = None;
            job.probing = false;
            apply_status(job, &mut state.rotation, job_id, stored.status);
            return true;
        }
        false
    }
}

/// Takes the next dispatchable unit from a job's ready queue
fn pick(job: &mut JobEntry, throttle: &HostThrottle, now: Instant) -> Pick {
    let mut earliest: Option<Instant> = None;
    let mut index = 0;

    while index < job.ready.len() {
        let unit_id = job.ready[index];
        let Some(unit) = job.frontier.get(unit_id) else {
            job.ready.remove(index);
            continue;
        };
        if unit.status != UnitStatus::Unvisited {
            job.ready.remove(index);
            continue;
        }

        let host = host_of(&unit.url);
        match throttle.wait_until(&host, now) {
            None => {
                job.ready.remove(index);
                return Pick::Unit(unit_id, host);
            }
            Some(until) => {
                earliest = Some(earliest.map_or(until, |e| e.min(until)));
                if job.spec.constraints.ordered {
                    break;
                }
                index += 1;
            }
        }
    }

    Pick::Wait(earliest)
}
