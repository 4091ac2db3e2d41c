//! Process-wide job registry
//!
//! The supervisor owns the session pool, the rule registry and the
//! scheduler. It is the single entry point callers use: submit, cancel,
//! status and results. On start-up it rebuilds every incomplete job from the
//! checkpoint store, which is the only way a job resumes after a restart.
//!
//! All of its state is passed in through [`SupervisorDeps`]; there are no
//! globals, so several supervisors can live side by side in tests.

mod report;

pub use report::{FailedUnit, JobReport};

use crate::config::Config;
use crate::crawler::{JobRegistration, Scheduler, SchedulerSettings};
use crate::extract::RuleRegistry;
use crate::job::{JobError, JobId, JobRequest};
use crate::pool::{PoolStats, SessionPool};
use crate::renderer::{build_factory, SessionFactory};
use crate::state::{Frontier, JobStatus};
use crate::storage::{
    open_store, Checkpoint, CheckpointStore, RecordCursor, RecordPage, StorageError, StorageResult,
};
use crate::CrawlError;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Collaborators a supervisor is built from
pub struct SupervisorDeps {
    pub config: Arc<Config>,
    pub store: Arc<dyn CheckpointStore>,
    pub factory: Arc<dyn SessionFactory>,
}

impl SupervisorDeps {
    /// Opens the store and renderer the configuration names
    pub fn from_config(config: Config) -> Result<Self, CrawlError> {
        let store = open_store(&config.checkpoint)?;
        let factory = build_factory(&config.browser)?;
        Ok(Self {
            config: Arc::new(config),
            store,
            factory,
        })
    }
}

/// Runs a store call on the blocking pool
async fn on_store<T, F>(store: &Arc<dyn CheckpointStore>, f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn CheckpointStore) -> StorageResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StorageError::Unavailable(format!("store task failed: {}", e)))?
}

pub struct JobSupervisor {
    config: Arc<Config>,
    store: Arc<dyn CheckpointStore>,
    pool: SessionPool,
    registry: RuleRegistry,
    scheduler: Scheduler,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl JobSupervisor {
    /// Builds the engine and resumes every incomplete job found in the store
    ///
    /// # Arguments
    ///
    /// * `deps` - Configuration, checkpoint store and session factory
    ///
    /// # Returns
    ///
    /// * `Ok(JobSupervisor)` - Running supervisor with recovered jobs registered
    /// * `Err(CrawlError)` - Invalid rules, or the store could not be read
    pub async fn start(deps: SupervisorDeps) -> Result<Self, CrawlError> {
        let SupervisorDeps {
            config,
            store,
            factory,
        } = deps;

        let registry = RuleRegistry::from_config(&config.rules)?;
        let pool = SessionPool::new(
            factory,
            config.engine.max_sessions as usize,
            Duration::from_millis(config.engine.lease_ttl_ms),
        );
        let scheduler = Scheduler::start(
            SchedulerSettings::from_config(&config),
            pool.clone(),
            Arc::clone(&store),
        );

        let reaper = pool.start_reaper(Duration::from_millis(config.engine.reap_interval_ms));
        let sweeper = spawn_sweeper(
            Arc::clone(&store),
            scheduler.clone(),
            config.checkpoint.retention_hours,
            Duration::from_secs(config.checkpoint.sweep_interval_secs),
        );

        let supervisor = Self {
            config,
            store,
            pool,
            registry,
            scheduler,
            background: Mutex::new(vec![reaper, sweeper]),
        };

        let resumed = supervisor.recover().await?;
        tracing::info!(
            "Supervisor started: {} jobs resumed, rules: {}",
            resumed,
            supervisor.registry.ids().collect::<Vec<_>>().join(", ")
        );

        Ok(supervisor)
    }

    /// Re-registers every job whose latest checkpoint is not terminal
    async fn recover(&self) -> Result<usize, CrawlError> {
        let incomplete = on_store(&self.store, |s| s.list_incomplete()).await?;
        let mut resumed = 0;

        for checkpoint in incomplete {
            let job_id = checkpoint.job_id;
            let rule = match self.registry.resolve(&checkpoint.spec.rule) {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::error!("Cannot resume job {}: {}", job_id, e);
                    self.fail_unresumable(checkpoint).await;
                    continue;
                }
            };

            let frontier =
                Frontier::from_snapshot(checkpoint.units, checkpoint.spec.constraints.max_units);
            let counts = frontier.counts();
            tracing::info!(
                "Resuming job {} at checkpoint {}: {} done, {} failed, {} remaining",
                job_id,
                checkpoint.sequence,
                counts.done,
                counts.failed,
                counts.unvisited
            );

            self.scheduler
                .register(JobRegistration {
                    job_id,
                    spec: checkpoint.spec,
                    rule,
                    frontier,
                    sequence: checkpoint.sequence,
                    cancel_requested: checkpoint.cancel_requested,
                    created_at: checkpoint.created_at,
                    last_checkpoint_at: Some(checkpoint.saved_at),
                })
                .await?;
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Marks a stored job failed when its rule no longer exists
    async fn fail_unresumable(&self, checkpoint: Checkpoint) {
        let job_id = checkpoint.job_id;
        let failed = Checkpoint {
            sequence: checkpoint.sequence + 1,
            status: JobStatus::Failed,
            saved_at: Utc::now(),
            ..checkpoint
        };
        if let Err(e) = on_store(&self.store, move |s| s.save(&failed)).await {
            tracing::warn!("Could not mark job {} failed: {}", job_id, e);
        }
    }

    /// Validates a job, writes its first checkpoint and hands it to the scheduler
    ///
    /// Returns as soon as the job is registered; crawling runs in the
    /// background.
    ///
    /// # Returns
    ///
    /// * `Ok(JobId)` - The new job's id
    /// * `Err(CrawlError::Job)` - Empty frontier, bad URL, unknown rule or bad constraint
    /// * `Err(CrawlError::Storage)` - The initial checkpoint could not be written
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, CrawlError> {
        let spec = request.into_spec(&self.config.jobs)?;
        let rule = self.registry.resolve(&spec.rule)?;
        let frontier = Frontier::from_seeds(
            &spec.seeds,
            spec.expected_selector.as_deref(),
            spec.constraints.max_units,
        )?;
        if frontier.is_empty() {
            return Err(JobError::EmptyFrontier.into());
        }

        let job_id = JobId::new();
        let now = Utc::now();
        let checkpoint = Checkpoint {
            job_id,
            sequence: 1,
            status: JobStatus::Pending,
            spec: spec.clone(),
            units: frontier.units().to_vec(),
            cancel_requested: false,
            created_at: now,
            saved_at: now,
        };

        let save_timeout = Duration::from_millis(self.config.checkpoint.save_timeout_ms);
        let save = on_store(&self.store, move |s| s.save(&checkpoint));
        match tokio::time::timeout(save_timeout, save).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StorageError::Unavailable(format!(
                    "initial checkpoint timed out after {:?}",
                    save_timeout
                ))
                .into())
            }
        }

        tracing::info!(
            "Submitted job {}: rule '{}', {} units, concurrency {}, retry budget {}",
            job_id,
            spec.rule,
            frontier.len(),
            spec.constraints.effective_concurrency(),
            spec.constraints.retry_budget
        );

        self.scheduler
            .register(JobRegistration {
                job_id,
                spec,
                rule,
                frontier,
                sequence: 1,
                cancel_requested: false,
                created_at: now,
                last_checkpoint_at: Some(now),
            })
            .await?;

        Ok(job_id)
    }

    /// Requests cancellation of a job
    ///
    /// Pending units are never dispatched; in-flight ones finish and are
    /// checkpointed before the job ends `cancelled`.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, CrawlError> {
        if self.scheduler.status(job_id).is_some() {
            return self.scheduler.cancel(job_id).await;
        }
        Ok(self.load(job_id).await?.status)
    }

    /// Current progress of a job, live or archived in the store
    pub async fn status(&self, job_id: JobId) -> Result<JobReport, CrawlError> {
        if let Some(report) = self.scheduler.report(job_id) {
            return Ok(report);
        }
        let checkpoint = self.load(job_id).await?;
        Ok(JobReport::from_checkpoint(&checkpoint))
    }

    /// Pages through a job's extraction records
    ///
    /// # Arguments
    ///
    /// * `job_id` - The job
    /// * `cursor` - `next_cursor` of the previous page, or `None` for the first page
    /// * `limit` - Page size
    pub async fn results(
        &self,
        job_id: JobId,
        cursor: Option<RecordCursor>,
        limit: usize,
    ) -> Result<RecordPage, CrawlError> {
        if self.scheduler.status(job_id).is_none() {
            self.load(job_id).await?;
        }
        Ok(on_store(&self.store, move |s| s.records(&job_id, cursor, limit)).await?)
    }

    /// Every job known to this process or the store, newest first
    pub async fn list(&self) -> Result<Vec<JobReport>, CrawlError> {
        let mut reports = self.scheduler.reports();
        let live: HashSet<JobId> = reports.iter().map(|r| r.job_id).collect();

        let stored = on_store(&self.store, |s| s.list_jobs()).await?;
        reports.extend(
            stored
                .iter()
                .filter(|c| !live.contains(&c.job_id))
                .map(JobReport::from_checkpoint),
        );
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reports)
    }

    /// Waits until a job reaches a terminal status
    pub async fn wait_for_terminal(&self, job_id: JobId) -> Result<JobReport, CrawlError> {
        if let Some(mut rx) = self.scheduler.subscribe(job_id) {
            // A closed channel means the job was swept; the store has the final word
            let _ = rx.wait_for(|status| status.is_terminal()).await;
        }
        self.status(job_id).await
    }

    /// Archives terminal jobs older than the retention window
    pub async fn sweep_expired(&self) -> Result<usize, CrawlError> {
        Ok(sweep(&self.store, &self.scheduler, self.config.checkpoint.retention_hours).await?)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.registry.ids().map(str::to_string).collect()
    }

    /// Stops dispatch, drains in-flight units and closes the session pool
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down supervisor");
        self.scheduler
            .shutdown(Duration::from_millis(self.config.engine.lease_ttl_ms))
            .await;
        self.pool.shutdown().await;

        let handles: Vec<_> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        let stats = self.pool.stats();
        tracing::info!(
            "Supervisor stopped: {} sessions opened, {} recycled, {} reclaimed",
            stats.opened,
            stats.recycled,
            stats.reclaimed
        );
    }

    async fn load(&self, job_id: JobId) -> Result<Checkpoint, CrawlError> {
        match on_store(&self.store, move |s| s.load(&job_id)).await {
            Ok(checkpoint) => Ok(checkpoint),
            Err(StorageError::NotFound(_)) => Err(CrawlError::JobNotFound(job_id)),
            Err(e) => Err(e.into()),
        }
    }
}

async fn sweep(
    store: &Arc<dyn CheckpointStore>,
    scheduler: &Scheduler,
    retention_hours: u64,
) -> StorageResult<usize> {
    let cutoff = Utc::now() - ChronoDuration::hours(retention_hours as i64);
    let purged = on_store(store, move |s| s.purge_terminal_before(cutoff)).await?;
    let forgotten = scheduler.forget_terminal_before(cutoff);
    if purged > 0 || forgotten > 0 {
        tracing::info!(
            "Retention sweep archived {} jobs ({} dropped from memory)",
            purged,
            forgotten
        );
    }
    Ok(purged)
}

fn spawn_sweeper(
    store: Arc<dyn CheckpointStore>,
    scheduler: Scheduler,
    retention_hours: u64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so start-up is not slowed by a sweep
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = sweep(&store, &scheduler, retention_hours).await {
                tracing::warn!("Retention sweep failed: {}", e);
            }
        }
    })
}
