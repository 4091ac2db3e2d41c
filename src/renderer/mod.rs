//! Page renderers
//!
//! A renderer session turns a URL into HTML. Sessions are opened by a
//! `SessionFactory` and handed out by the session pool; the scheduler never
//! talks to a browser directly. Two engines are provided:
//! - `chromium`: a shared headless (or headed) Chromium, one tab per session
//! - `http`: plain HTTP GET through reqwest, no JavaScript

mod chromium;
mod http;

pub use chromium::ChromiumFactory;
pub use http::HttpFactory;

use crate::config::{BrowserConfig, RenderEngine};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// One page load
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub url: String,

    /// The page counts as loaded once this selector matches
    pub expected_selector: Option<String>,

    pub timeout: Duration,
}

/// What a renderer hands to the extraction pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    /// URL after redirects
    pub final_url: Url,
    pub html: String,

    /// HTTP status, when the engine reports one
    pub status: Option<u16>,
}

/// Unit-level render failures
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("render timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("{url} answered with HTTP {status}")]
    Http { url: String, status: u16 },

    #[error("selector '{selector}' never appeared on {url}")]
    NotReady { url: String, selector: String },

    #[error("failed to launch renderer: {0}")]
    Launch(String),

    #[error("renderer crashed: {0}")]
    Crashed(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("session lease was revoked")]
    LeaseRevoked,
}

impl RenderError {
    /// Whether the session that produced this error should be discarded
    pub fn is_session_fault(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Crashed(_)
                | Self::SessionClosed
                | Self::LeaseRevoked
                | Self::Launch(_)
        )
    }
}

/// A live renderer, leased to one worker at a time
#[async_trait]
pub trait RenderSession: Send {
    /// Loads the page and returns its HTML
    ///
    /// Implementations honour `request.timeout`; callers also bound the call.
    async fn render(&mut self, request: &RenderRequest) -> Result<RenderOutput, RenderError>;

    /// Releases the session's resources; later renders fail with `SessionClosed`
    async fn close(&mut self);
}

/// Opens renderer sessions for the pool
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError>;

    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Tears down shared resources such as the browser process
    async fn shutdown(&self) {}
}

/// Builds the factory for the configured engine
///
/// # Arguments
///
/// * `config` - The `[browser]` configuration section
///
/// # Returns
///
/// * `Ok(factory)` - Ready to open sessions; Chromium launches on first use
/// * `Err(RenderError)` - The HTTP client could not be built
pub fn build_factory(config: &BrowserConfig) -> Result<Arc<dyn SessionFactory>, RenderError> {
    let factory: Arc<dyn SessionFactory> = match config.engine {
        RenderEngine::Chromium => Arc::new(ChromiumFactory::new(config.clone())),
        RenderEngine::Http => Arc::new(HttpFactory::new(config)?),
    };

    tracing::info!("Using {} renderer", factory.name());
    Ok(factory)
}

/// Checks a readiness selector against static HTML
pub(crate) fn html_has_selector(html: &str, selector: &str) -> bool {
    let Ok(selector) = Selector::parse(selector) else {
        return false;
    };
    Html::parse_document(html).select(&selector).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_faults() {
        assert!(RenderError::Timeout(Duration::from_secs(1)).is_session_fault());
        assert!(RenderError::Crashed("gone".into()).is_session_fault());
        assert!(!RenderError::Http {
            url: "https://example.com/".into(),
            status: 503
        }
        .is_session_fault());
        assert!(!RenderError::NotReady {
            url: "https://example.com/".into(),
            selector: "main".into()
        }
        .is_session_fault());
    }

    #[test]
    fn test_html_has_selector() {
        let html = "<html><body><main id='app'>ready</main></body></html>";
        assert!(html_has_selector(html, "main#app"));
        assert!(!html_has_selector(html, ".spinner"));
        assert!(!html_has_selector(html, "main["));
    }

    #[test]
    fn test_build_http_factory() {
        let config = BrowserConfig {
            engine: RenderEngine::Http,
            ..BrowserConfig::default()
        };
        let factory = build_factory(&config).unwrap();
        assert_eq!(factory.name(), "http");
    }
}
