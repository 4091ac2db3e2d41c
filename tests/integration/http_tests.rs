//! The plain-HTTP renderer against a mock server

use crate::common::{finish, start_supervisor, test_config, FlakyStore};
use crawl_keeper::config::RenderEngine;
use crawl_keeper::renderer::build_factory;
use crawl_keeper::state::JobStatus;
use crawl_keeper::JobRequest;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LISTING_PAGE: &str = r#"<html>
<head><title>Catalogue</title><meta name="description" content="All items"></head>
<body>
  <div class="ready">
    <a href="/items/1">First item</a>
    <a href="/items/2?utm_source=feed">Second item</a>
    <a href="https://elsewhere.test/">Partner</a>
  </div>
</body>
</html>"#;

async fn mount_html(server: &MockServer, route: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_raw(body, "text/html"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_http_renderer_extracts_links() {
    let server = MockServer::start().await;
    mount_html(&server, "/catalogue", 200, LISTING_PAGE).await;

    let mut config = test_config();
    config.browser.engine = RenderEngine::Http;
    let factory = build_factory(&config.browser).unwrap();
    let supervisor = start_supervisor(config, FlakyStore::in_memory(), factory).await;

    let catalogue = format!("{}/catalogue", server.uri());
    let job_id = supervisor
        .submit(JobRequest::new("links", [catalogue.as_str()]))
        .await
        .unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 1);

    let page = supervisor.results(job_id, None, 10).await.unwrap();
    let hrefs: Vec<&str> = page
        .records
        .iter()
        .map(|r| r.payload["href"].as_str().unwrap())
        .collect();
    assert_eq!(hrefs.len(), 3);
    assert_eq!(hrefs[0], format!("{}/items/1", server.uri()));
    assert_eq!(hrefs[1], format!("{}/items/2", server.uri()));
    assert_eq!(hrefs[2], "https://elsewhere.test/");
    assert_eq!(page.records[0].payload["text"], "First item");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_http_errors_and_missing_selector_fail_units() {
    let server = MockServer::start().await;
    mount_html(&server, "/ok", 200, LISTING_PAGE).await;
    mount_html(&server, "/plain", 200, "<html><body><p>No marker</p></body></html>").await;
    mount_html(&server, "/broken", 500, "oops").await;

    let mut config = test_config();
    config.browser.engine = RenderEngine::Http;
    let factory = build_factory(&config.browser).unwrap();
    let supervisor = start_supervisor(config, FlakyStore::in_memory(), factory).await;

    let ok = format!("{}/ok", server.uri());
    let plain = format!("{}/plain", server.uri());
    let broken = format!("{}/broken", server.uri());

    let mut request = JobRequest::new("document", [ok.as_str(), plain.as_str(), broken.as_str()]);
    request.expected_selector = Some(".ready".to_string());
    request.retry_budget = Some(0);
    request.poison_threshold = Some(0.9);
    let job_id = supervisor.submit(request).await.unwrap();

    let report = finish(&supervisor, job_id).await;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.done, 1);
    assert_eq!(report.failed, 2);

    let error_of = |url: &str| {
        report
            .failed_units
            .iter()
            .find(|u| u.url == url)
            .and_then(|u| u.last_error.clone())
            .unwrap()
    };
    assert!(error_of(&plain).contains("never appeared"));
    assert!(error_of(&broken).contains("HTTP 500"));

    let page = supervisor.results(job_id, None, 10).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].payload["title"], "Catalogue");
    assert_eq!(page.records[0].payload["description"], "All items");

    supervisor.shutdown().await;
}
