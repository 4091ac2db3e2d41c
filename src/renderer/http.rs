//! Plain HTTP renderer
//!
//! Fetches pages with a shared reqwest client. Pages that need JavaScript to
//! show their content will not pass a readiness selector here.

use crate::config::BrowserConfig;
use crate::renderer::{
    html_has_selector, RenderError, RenderOutput, RenderRequest, RenderSession, SessionFactory,
};
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::time::Duration;

/// Builds the HTTP client shared by all sessions
///
/// # Arguments
///
/// * `config` - The browser configuration (user agent and request timeout)
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &BrowserConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

pub struct HttpFactory {
    client: Client,
}

impl HttpFactory {
    pub fn new(config: &BrowserConfig) -> Result<Self, RenderError> {
        let client = build_http_client(config).map_err(|e| RenderError::Launch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionFactory for HttpFactory {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        Ok(Box::new(HttpSession {
            client: Some(self.client.clone()),
        }))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct HttpSession {
    client: Option<Client>,
}

#[async_trait]
impl RenderSession for HttpSession {
    async fn render(&mut self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let client = self.client.as_ref().ok_or(RenderError::SessionClosed)?;

        let response = client
            .get(&request.url)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(|e| classify(&request.url, request.timeout, e))?;

        let status = response.status();
        let final_url = response.url().clone();
        if !status.is_success() {
            return Err(RenderError::Http {
                url: final_url.to_string(),
                status: status.as_u16(),
            });
        }

        let html = response
            .text()
            .await
            .map_err(|e| classify(&request.url, request.timeout, e))?;

        if let Some(selector) = &request.expected_selector {
            if !html_has_selector(&html, selector) {
                return Err(RenderError::NotReady {
                    url: final_url.to_string(),
                    selector: selector.clone(),
                });
            }
        }

        tracing::trace!("Fetched {} ({} bytes)", final_url, html.len());
        Ok(RenderOutput {
            final_url,
            html,
            status: Some(status.as_u16()),
        })
    }

    async fn close(&mut self) {
        self.client = None;
    }
}

fn classify(url: &str, timeout: Duration, error: reqwest::Error) -> RenderError {
    if error.is_timeout() {
        RenderError::Timeout(timeout)
    } else {
        RenderError::Navigation {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}
