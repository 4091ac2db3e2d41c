//! Halting on store failures, restart recovery and retention

use crate::common::{
    finish, start_supervisor, test_config, wait_for_report, FlakyStore, ScriptedFactory,
};
use chrono::Utc;
use crawl_keeper::config::JobDefaults;
use crawl_keeper::state::{Frontier, JobStatus};
use crawl_keeper::storage::{Checkpoint, CheckpointStore, SqliteStore};
use crawl_keeper::{CrawlError, JobId, JobRequest, JobSupervisor, SupervisorDeps};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

fn urls(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("https://a.test/{}", i)).collect()
}

#[tokio::test]
async fn test_store_outage_halts_and_resumes_without_rework() {
    let factory = ScriptedFactory::new();
    let store = FlakyStore::in_memory();
    // The initial checkpoint and the first unit's commit go through
    store.fail_after(2);
    let supervisor = start_supervisor(test_config(), store.clone(), factory.as_factory()).await;

    let mut request = JobRequest::new("document", urls(5));
    request.ordered = true;
    let job_id = supervisor.submit(request).await.unwrap();

    let halted = wait_for_report(&supervisor, job_id, |r| r.halted_reason.is_some()).await;
    assert_eq!(halted.status, JobStatus::Running);
    assert_eq!(halted.done, 1);
    assert!(halted
        .halted_reason
        .as_deref()
        .unwrap()
        .starts_with("CheckpointWriteFailure"));

    // No dispatch while halted, across several probe intervals
    let renders_at_halt = factory.total_renders();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(factory.total_renders(), renders_at_halt);
    assert_eq!(renders_at_halt, 2);

    store.set_failing(false);
    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 5);
    assert!(report.halted_reason.is_none());

    assert_eq!(factory.renders("https://a.test/1"), 1);
    // Its commit was lost, so the second unit ran again
    assert_eq!(factory.renders("https://a.test/2"), 2);
    for url in &urls(5)[2..] {
        assert_eq!(factory.renders(url), 1);
    }

    let history = store.history(job_id);
    for pair in history.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
        assert!(pair[1].done >= pair[0].done);
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_store_rejects_start_and_submission() {
    let store = FlakyStore::in_memory();
    store.set_failing(true);

    // Recovery cannot list incomplete jobs
    let result = JobSupervisor::start(SupervisorDeps {
        config: Arc::new(test_config()),
        store: store.clone(),
        factory: ScriptedFactory::new().as_factory(),
    })
    .await;
    assert!(matches!(result, Err(CrawlError::Storage(_))));

    store.set_failing(false);
    let supervisor =
        start_supervisor(test_config(), store.clone(), ScriptedFactory::new().as_factory()).await;

    // The initial checkpoint cannot be written
    store.set_failing(true);
    let submitted = supervisor
        .submit(JobRequest::new("document", ["https://a.test/"]))
        .await;
    assert!(matches!(submitted, Err(CrawlError::Storage(_))));

    store.set_failing(false);
    assert!(supervisor.list().await.unwrap().is_empty());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_restart_resumes_only_unfinished_units() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("jobs.db");

    // First process: two units get through, the third hangs forever
    let gate = Arc::new(Semaphore::new(2));
    let first_factory = ScriptedFactory::new();
    first_factory.gate(Arc::clone(&gate));
    let first_store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let first = start_supervisor(test_config(), first_store, first_factory.as_factory()).await;

    let mut request = JobRequest::new("document", urls(4));
    request.max_concurrency = Some(1);
    let job_id = first.submit(request).await.unwrap();
    wait_for_report(&first, job_id, |r| r.done == 2).await;

    // Second process on the same database
    let second_factory = ScriptedFactory::new();
    let second_store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let second = start_supervisor(test_config(), second_store, second_factory.as_factory()).await;

    let report = finish(&second, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 4);

    assert_eq!(second_factory.renders("https://a.test/1"), 0);
    assert_eq!(second_factory.renders("https://a.test/2"), 0);
    assert_eq!(second_factory.renders("https://a.test/3"), 1);
    assert_eq!(second_factory.renders("https://a.test/4"), 1);

    let page = second.results(job_id, None, 100).await.unwrap();
    assert_eq!(page.records.len(), 4);
    let units: HashSet<u32> = page.records.iter().map(|r| r.unit_id).collect();
    assert_eq!(units.len(), 4);

    second.shutdown().await;
}

#[tokio::test]
async fn test_restart_skips_finished_jobs() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("jobs.db");

    let factory = ScriptedFactory::new();
    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let supervisor = start_supervisor(test_config(), store, factory.as_factory()).await;
    let job_id = supervisor
        .submit(JobRequest::new("document", urls(2)))
        .await
        .unwrap();
    finish(&supervisor, job_id).await;
    supervisor.shutdown().await;

    let factory = ScriptedFactory::new();
    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::open(&db).unwrap());
    let supervisor = start_supervisor(test_config(), store, factory.as_factory()).await;

    let report = supervisor.status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 2);
    assert_eq!(factory.total_renders(), 0);

    let jobs = supervisor.list().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, job_id);

    supervisor.shutdown().await;
}

fn stored_checkpoint(rule: &str, cancel_requested: bool) -> Checkpoint {
    let spec = JobRequest::new(rule, urls(3))
        .into_spec(&JobDefaults::default())
        .unwrap();
    let frontier = Frontier::from_seeds(&spec.seeds, None, spec.constraints.max_units).unwrap();
    let now = Utc::now();
    Checkpoint {
        job_id: JobId::new(),
        sequence: 7,
        status: JobStatus::Running,
        spec,
        units: frontier.units().to_vec(),
        cancel_requested,
        created_at: now,
        saved_at: now,
    }
}

#[tokio::test]
async fn test_recovered_cancelling_job_ends_cancelled() {
    let store = FlakyStore::in_memory();
    let checkpoint = stored_checkpoint("document", true);
    let job_id = checkpoint.job_id;
    store.save(&checkpoint).unwrap();

    let factory = ScriptedFactory::new();
    let supervisor = start_supervisor(test_config(), store.clone(), factory.as_factory()).await;

    let report = supervisor.status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.pending, 3);
    assert_eq!(factory.total_renders(), 0);

    let last = store.history(job_id).last().cloned().unwrap();
    assert_eq!(last.sequence, 8);
    assert_eq!(last.status, JobStatus::Cancelled);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_recovered_job_with_unknown_rule_fails() {
    let store = FlakyStore::in_memory();
    let checkpoint = stored_checkpoint("retired-rule", false);
    let job_id = checkpoint.job_id;
    store.save(&checkpoint).unwrap();

    let supervisor =
        start_supervisor(test_config(), store.clone(), ScriptedFactory::new().as_factory()).await;

    let report = supervisor.status(job_id).await.unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(store.load(&job_id).unwrap().sequence, 8);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_sweep_archives_expired_jobs() {
    let mut config = test_config();
    config.checkpoint.retention_hours = 0;

    let store = FlakyStore::in_memory();
    let supervisor = start_supervisor(config, store.clone(), ScriptedFactory::new().as_factory()).await;
    let job_id = supervisor
        .submit(JobRequest::new("document", urls(1)))
        .await
        .unwrap();
    finish(&supervisor, job_id).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(supervisor.sweep_expired().await.unwrap(), 1);
    assert!(matches!(
        supervisor.status(job_id).await,
        Err(CrawlError::JobNotFound(_))
    ));

    supervisor.shutdown().await;
}
