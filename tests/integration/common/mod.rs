//! Test doubles shared by the integration tests
//!
//! `ScriptedFactory` stands in for the browser: pages, failures and pauses
//! are scripted per URL. `FlakyStore` wraps a real store and can be told to
//! start refusing writes.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawl_keeper::config::{Config, RetryConfig};
use crawl_keeper::job::{ExtractionRecord, JobId};
use crawl_keeper::renderer::{RenderError, RenderOutput, RenderRequest, RenderSession, SessionFactory};
use crawl_keeper::state::JobStatus;
use crawl_keeper::storage::{
    Checkpoint, CheckpointStore, MemoryStore, RecordCursor, RecordPage, StorageError, StorageResult,
};
use crawl_keeper::supervisor::JobReport;
use crawl_keeper::{JobSupervisor, SupervisorDeps};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

/// Engine configuration with delays small enough for tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.max_sessions = 4;
    config.engine.max_workers = 8;
    config.engine.acquire_timeout_ms = 2_000;
    config.engine.lease_ttl_ms = 10_000;
    config.engine.reap_interval_ms = 100;
    config.engine.pool_retry_delay_ms = 10;
    config.engine.halt_probe_interval_ms = 50;
    config.retry = RetryConfig {
        base_delay_ms: 10,
        max_delay_ms: 50,
        multiplier: 2.0,
        jitter_ms: 0,
    };
    config.checkpoint.save_timeout_ms = 2_000;
    config.jobs.unit_timeout_ms = 2_000;
    config
}

pub async fn start_supervisor(
    config: Config,
    store: Arc<dyn CheckpointStore>,
    factory: Arc<dyn SessionFactory>,
) -> JobSupervisor {
    JobSupervisor::start(SupervisorDeps {
        config: Arc::new(config),
        store,
        factory,
    })
    .await
    .unwrap()
}

/// Waits for a job to finish, failing the test after ten seconds
pub async fn finish(supervisor: &JobSupervisor, job_id: JobId) -> JobReport {
    tokio::time::timeout(Duration::from_secs(10), supervisor.wait_for_terminal(job_id))
        .await
        .expect("job did not reach a terminal status in time")
        .unwrap()
}

/// Polls until `condition` holds, failing the test after five seconds
pub async fn eventually<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct Script {
    pages: Mutex<HashMap<String, String>>,
    fail_always: Mutex<HashSet<String>>,
    fail_times: Mutex<HashMap<String, u32>>,
    renders: Mutex<HashMap<String, u32>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    delay_ms: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// In-process renderer whose behaviour is scripted per URL
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `html` for `url` instead of the generated page
    pub fn page(&self, url: &str, html: &str) -> &Self {
        self.script
            .pages
            .lock()
            .unwrap()
            .insert(url.to_string(), html.to_string());
        self
    }

    /// Every render of `url` fails
    pub fn fail_always(&self, url: &str) -> &Self {
        self.script.fail_always.lock().unwrap().insert(url.to_string());
        self
    }

    /// The first `times` renders of `url` fail
    pub fn fail_times(&self, url: &str, times: u32) -> &Self {
        self.script
            .fail_times
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    /// Renders wait for a permit of `gate` and consume it
    pub fn gate(&self, gate: Arc<Semaphore>) -> &Self {
        *self.script.gate.lock().unwrap() = Some(gate);
        self
    }

    pub fn delay(&self, delay: Duration) -> &Self {
        self.script
            .delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
        self
    }

    pub fn renders(&self, url: &str) -> u32 {
        self.script
            .renders
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_renders(&self) -> u32 {
        self.script.renders.lock().unwrap().values().sum()
    }

    /// Renders currently running
    pub fn active(&self) -> usize {
        self.script.active.load(Ordering::SeqCst)
    }

    pub fn peak_active(&self) -> usize {
        self.script.peak.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.script.opened.load(Ordering::SeqCst)
    }

    pub fn as_factory(&self) -> Arc<dyn SessionFactory> {
        Arc::new(self.clone())
    }
}

fn generated_page(url: &str) -> String {
    format!(
        "<html><head><title>{url}</title></head><body><p>Content of {url}</p></body></html>",
        url = url
    )
}

struct ScriptedSession {
    script: Arc<Script>,
    closed: bool,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RenderSession for ScriptedSession {
    async fn render(&mut self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        if self.closed {
            return Err(RenderError::SessionClosed);
        }

        let script = Arc::clone(&self.script);
        let now_active = script.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&script.active);
        script.peak.fetch_max(now_active, Ordering::SeqCst);

        let gate = script.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let delay = script.delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        *script
            .renders
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_insert(0) += 1;

        let scripted_failure = {
            let mut fail_times = script.fail_times.lock().unwrap();
            match fail_times.get_mut(&request.url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if scripted_failure || script.fail_always.lock().unwrap().contains(&request.url) {
            return Err(RenderError::Navigation {
                url: request.url.clone(),
                message: "scripted failure".to_string(),
            });
        }

        let html = script
            .pages
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| generated_page(&request.url));

        Ok(RenderOutput {
            final_url: Url::parse(&request.url).unwrap(),
            html,
            status: Some(200),
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.script.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        self.script.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// One successful commit as seen by the store
#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub job_id: JobId,
    pub sequence: u64,
    pub status: JobStatus,
    pub done: usize,
    pub records: usize,
    pub saved_at: DateTime<Utc>,
}

/// A store that can be switched into refusing every call
pub struct FlakyStore {
    inner: Arc<dyn CheckpointStore>,
    failing: AtomicBool,
    /// Commits left before the store starts failing; negative means never
    fail_after: AtomicI64,
    history: Mutex<Vec<CommitEntry>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            fail_after: AtomicI64::new(-1),
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn fail_after(&self, commits: i64) {
        self.fail_after.store(commits, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
        if !failing {
            self.fail_after.store(-1, Ordering::SeqCst);
        }
    }

    pub fn history(&self, job_id: JobId) -> Vec<CommitEntry> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect()
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("store is down".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CheckpointStore for FlakyStore {
    fn commit(&self, checkpoint: &Checkpoint, records: &[ExtractionRecord]) -> StorageResult<()> {
        self.check()?;
        let left = self.fail_after.load(Ordering::SeqCst);
        if left == 0 {
            self.failing.store(true, Ordering::SeqCst);
            return Err(StorageError::Unavailable("store went down".to_string()));
        }
        if left > 0 {
            self.fail_after.store(left - 1, Ordering::SeqCst);
        }

        self.inner.commit(checkpoint, records)?;
        self.history.lock().unwrap().push(CommitEntry {
            job_id: checkpoint.job_id,
            sequence: checkpoint.sequence,
            status: checkpoint.status,
            done: checkpoint.done_count(),
            records: records.len(),
            saved_at: checkpoint.saved_at,
        });
        Ok(())
    }

    fn load(&self, job_id: &JobId) -> StorageResult<Checkpoint> {
        self.check()?;
        self.inner.load(job_id)
    }

    fn list_incomplete(&self) -> StorageResult<Vec<Checkpoint>> {
        self.check()?;
        self.inner.list_incomplete()
    }

    fn list_jobs(&self) -> StorageResult<Vec<Checkpoint>> {
        self.check()?;
        self.inner.list_jobs()
    }

    fn records(
        &self,
        job_id: &JobId,
        cursor: Option<RecordCursor>,
        limit: usize,
    ) -> StorageResult<RecordPage> {
        self.check()?;
        self.inner.records(job_id, cursor, limit)
    }

    fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        self.check()?;
        self.inner.purge_terminal_before(cutoff)
    }
}

/// Polls a job's report until `condition` holds, failing the test after five seconds
pub async fn wait_for_report<F>(supervisor: &JobSupervisor, job_id: JobId, condition: F) -> JobReport
where
    F: Fn(&JobReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let report = supervisor.status(job_id).await.unwrap();
        if condition(&report) {
            return report;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on job {}: {:?}", job_id, report);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
