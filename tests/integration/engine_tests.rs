//! Scheduling, retry, cancellation and pool behaviour end to end

use crate::common::{eventually, finish, start_supervisor, test_config, FlakyStore, ScriptedFactory};
use crawl_keeper::config::{RuleEntry, RuleKind};
use crawl_keeper::state::JobStatus;
use crawl_keeper::JobRequest;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const URLS: [&str; 3] = ["https://a.test/1", "https://a.test/2", "https://a.test/3"];

#[tokio::test]
async fn test_unit_failing_past_budget_is_enumerated() {
    let factory = ScriptedFactory::new();
    factory.fail_always("https://a.test/2");
    let store = FlakyStore::in_memory();
    let supervisor = start_supervisor(test_config(), store.clone(), factory.as_factory()).await;

    let mut request = JobRequest::new("document", URLS);
    request.retry_budget = Some(1);
    request.poison_threshold = Some(0.5);
    let job_id = supervisor.submit(request).await.unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.total, 3);
    assert_eq!(report.failed_units.len(), 1);
    assert_eq!(report.failed_units[0].url, "https://a.test/2");
    assert_eq!(report.failed_units[0].attempts, 2);
    assert!(report.failed_units[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("scripted failure"));

    // Budget 1 means exactly two attempts
    assert_eq!(factory.renders("https://a.test/2"), 2);
    assert_eq!(factory.renders("https://a.test/1"), 1);

    let page = supervisor.results(job_id, None, 10).await.unwrap();
    assert_eq!(page.records.len(), 2);
    assert!(page.next_cursor.is_none());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_within_budget() {
    let factory = ScriptedFactory::new();
    factory.fail_times("https://a.test/1", 2);
    let supervisor =
        start_supervisor(test_config(), FlakyStore::in_memory(), factory.as_factory()).await;

    let mut request = JobRequest::new("document", ["https://a.test/1"]);
    request.retry_budget = Some(2);
    let job_id = supervisor.submit(request).await.unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 1);
    assert!(report.failed_units.is_empty());
    assert_eq!(factory.renders("https://a.test/1"), 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_extraction_failure_rerenders_within_budget() {
    let factory = ScriptedFactory::new();
    factory.page("https://a.test/2", "   ");
    let supervisor =
        start_supervisor(test_config(), FlakyStore::in_memory(), factory.as_factory()).await;

    let mut request = JobRequest::new("document", URLS);
    request.retry_budget = Some(1);
    request.poison_threshold = Some(0.5);
    let job_id = supervisor.submit(request).await.unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 2);
    assert_eq!(report.failed, 1);

    // Raw output is not kept, so every retry renders the page again
    assert_eq!(factory.renders("https://a.test/2"), 2);
    let failed = &report.failed_units[0];
    assert_eq!(failed.url, "https://a.test/2");
    assert_eq!(failed.attempts, 2);
    assert!(failed.last_error.as_deref().unwrap().contains("is empty"));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_poisoned_job_fails() {
    let factory = ScriptedFactory::new();
    factory.fail_always("https://a.test/1").fail_always("https://a.test/2");
    let supervisor =
        start_supervisor(test_config(), FlakyStore::in_memory(), factory.as_factory()).await;

    let mut request = JobRequest::new("document", URLS);
    request.retry_budget = Some(0);
    request.poison_threshold = Some(0.4);
    request.ordered = true;
    let job_id = supervisor.submit(request).await.unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Failed);
    assert!(report.failure_reason.as_deref().unwrap().starts_with("PoisonJob"));
    // Ordered dispatch stops at the second failure, before the third unit
    assert_eq!(factory.renders("https://a.test/3"), 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_cancel_drains_in_flight_and_drops_pending() {
    let gate = Arc::new(Semaphore::new(0));
    let factory = ScriptedFactory::new();
    factory.gate(Arc::clone(&gate));
    let store = FlakyStore::in_memory();
    let supervisor = start_supervisor(test_config(), store.clone(), factory.as_factory()).await;

    let urls: Vec<String> = (1..=5).map(|i| format!("https://a.test/{}", i)).collect();
    let mut request = JobRequest::new("document", urls);
    request.max_concurrency = Some(2);
    let job_id = supervisor.submit(request).await.unwrap();

    eventually(|| factory.active() == 2, "two units in flight").await;

    let status = supervisor.cancel(job_id).await.unwrap();
    assert_eq!(status, JobStatus::Running);
    let report = supervisor.status(job_id).await.unwrap();
    assert!(report.cancelling);
    assert_eq!(report.in_flight, 2);

    gate.add_permits(10);
    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.done, 2);
    assert_eq!(report.pending, 3);
    assert!(!report.cancelling);

    // Pending units were never rendered
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.total_renders(), 2);

    let history = store.history(job_id);
    let last = history.last().unwrap();
    assert_eq!(last.status, JobStatus::Cancelled);
    assert_eq!(last.done, 2);

    // Cancelling a finished job is a no-op
    assert_eq!(supervisor.cancel(job_id).await.unwrap(), JobStatus::Cancelled);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_leases_never_exceed_session_ceiling() {
    let mut config = test_config();
    config.engine.max_sessions = 2;
    config.engine.max_workers = 8;

    let factory = ScriptedFactory::new();
    factory.delay(Duration::from_millis(30));
    let supervisor = start_supervisor(config, FlakyStore::in_memory(), factory.as_factory()).await;

    let urls: Vec<String> = (1..=6).map(|i| format!("https://a.test/{}", i)).collect();
    let mut request = JobRequest::new("document", urls);
    request.max_concurrency = Some(6);
    let job_id = supervisor.submit(request).await.unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 6);

    assert!(factory.peak_active() <= 2);
    let stats = supervisor.pool_stats();
    assert!(stats.peak_leased <= 2);
    assert_eq!(stats.leased, 0);
    assert!(factory.opened() <= 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_jobs_share_workers_round_robin() {
    let mut config = test_config();
    config.engine.max_sessions = 1;
    config.engine.max_workers = 1;

    let factory = ScriptedFactory::new();
    factory.delay(Duration::from_millis(5));
    let supervisor = start_supervisor(config, FlakyStore::in_memory(), factory.as_factory()).await;

    let first = supervisor
        .submit(JobRequest::new("document", ["https://a.test/1", "https://a.test/2"]))
        .await
        .unwrap();
    let second = supervisor
        .submit(JobRequest::new("document", ["https://b.test/1", "https://b.test/2"]))
        .await
        .unwrap();

    assert_eq!(finish(&supervisor, first).await.done, 2);
    assert_eq!(finish(&supervisor, second).await.done, 2);
    assert_eq!(factory.total_renders(), 4);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_checkpoints_are_monotonic() {
    let factory = ScriptedFactory::new();
    factory.fail_times("https://a.test/2", 1);
    let store = FlakyStore::in_memory();
    let supervisor = start_supervisor(test_config(), store.clone(), factory.as_factory()).await;

    let mut request = JobRequest::new("document", URLS);
    request.max_concurrency = Some(3);
    let job_id = supervisor.submit(request).await.unwrap();
    finish(&supervisor, job_id).await;

    let history = store.history(job_id);
    assert_eq!(history.first().unwrap().status, JobStatus::Pending);
    assert_eq!(history.last().unwrap().status, JobStatus::Completed);
    for pair in history.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
        assert!(pair[1].done >= pair[0].done);
        assert!(pair[1].saved_at >= pair[0].saved_at);
    }
    // Each done unit's records landed with the commit that marked it done
    assert_eq!(history.iter().map(|c| c.records).sum::<usize>(), 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_follow_links_expands_frontier() {
    let mut config = test_config();
    config.rules.push(RuleEntry {
        id: "crawl".to_string(),
        kind: RuleKind::Document,
        item: None,
        fields: vec![],
        follow_links: true,
        allowed_hosts: vec![],
    });

    let factory = ScriptedFactory::new();
    factory.page(
        "https://a.test/",
        r#"<html><head><title>Home</title></head><body>
            <a href="/a">A</a>
            <a href="/b#top">B</a>
            <a href="https://a.test/a">A again</a>
            <a href="https://other.test/x">Elsewhere</a>
        </body></html>"#,
    );
    let supervisor = start_supervisor(config, FlakyStore::in_memory(), factory.as_factory()).await;

    let job_id = supervisor
        .submit(JobRequest::new("crawl", ["https://a.test/"]))
        .await
        .unwrap();
    let report = finish(&supervisor, job_id).await;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.total, 3);
    assert_eq!(report.done, 3);
    assert_eq!(factory.renders("https://a.test/a"), 1);
    assert_eq!(factory.renders("https://a.test/b"), 1);
    assert_eq!(factory.renders("https://other.test/x"), 0);

    let page = supervisor.results(job_id, None, 10).await.unwrap();
    let urls: HashSet<String> = page
        .records
        .iter()
        .map(|r| r.payload["url"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(urls.len(), 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_frontier_expansion_respects_max_units() {
    let mut config = test_config();
    config.rules.push(RuleEntry {
        id: "crawl".to_string(),
        kind: RuleKind::Links,
        item: None,
        fields: vec![],
        follow_links: true,
        allowed_hosts: vec![],
    });

    let factory = ScriptedFactory::new();
    factory.page(
        "https://a.test/",
        r#"<html><body><a href="/a">A</a><a href="/b">B</a><a href="/c">C</a></body></html>"#,
    );
    let supervisor = start_supervisor(config, FlakyStore::in_memory(), factory.as_factory()).await;

    let mut request = JobRequest::new("crawl", ["https://a.test/"]);
    request.max_units = Some(2);
    let job_id = supervisor.submit(request).await.unwrap();
    let report = finish(&supervisor, job_id).await;

    assert_eq!(report.total, 2);
    assert_eq!(report.done, 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_bad_jobs() {
    let supervisor = start_supervisor(
        test_config(),
        FlakyStore::in_memory(),
        ScriptedFactory::new().as_factory(),
    )
    .await;

    let empty = JobRequest::new("document", Vec::<String>::new());
    assert!(supervisor.submit(empty).await.is_err());

    let unknown = JobRequest::new("no-such-rule", ["https://a.test/"]);
    assert!(supervisor.submit(unknown).await.is_err());

    let bad_url = JobRequest::new("document", ["not a url"]);
    assert!(supervisor.submit(bad_url).await.is_err());

    assert!(supervisor.list().await.unwrap().is_empty());
    supervisor.shutdown().await;
}
