//! Chromium renderer
//!
//! One browser process is launched on first use and shared; each session owns
//! a tab. When the browser dies, the next `open` relaunches it.

use crate::config::BrowserConfig;
use crate::renderer::{RenderError, RenderOutput, RenderRequest, RenderSession, SessionFactory};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct LaunchedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

pub struct ChromiumFactory {
    config: BrowserConfig,
    browser: Mutex<Option<LaunchedBrowser>>,
}

impl ChromiumFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            browser: Mutex::new(None),
        }
    }

    async fn launch(&self) -> Result<LaunchedBrowser, RenderError> {
        let user_data_dir =
            std::env::temp_dir().join(format!("crawl-keeper-chrome-{}", std::process::id()));

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_millis(self.config.request_timeout_ms))
            .window_size(self.config.window_width, self.config.window_height)
            .user_data_dir(user_data_dir);

        if let Some(path) = &self.config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        builder = if self.config.headless {
            builder.headless_mode(HeadlessMode::default())
        } else {
            builder.with_head()
        };

        let browser_config = builder
            .arg(format!("--user-agent={}", self.config.user_agent))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--mute-audio")
            .build()
            .map_err(RenderError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!("Browser handler event error: {}", e);
                }
            }
            tracing::debug!("Browser handler finished");
        });

        tracing::info!(
            "Launched Chromium ({})",
            if self.config.headless { "headless" } else { "headed" }
        );
        Ok(LaunchedBrowser { browser, handler })
    }
}

#[async_trait]
impl SessionFactory for ChromiumFactory {
    async fn open(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        let mut guard = self.browser.lock().await;

        if guard.as_ref().is_some_and(|b| b.handler.is_finished()) {
            tracing::warn!("Chromium exited, relaunching");
            *guard = None;
        }

        if guard.is_none() {
            *guard = Some(self.launch().await?);
        }

        let Some(launched) = guard.as_ref() else {
            return Err(RenderError::SessionClosed);
        };

        match launched.browser.new_page("about:blank").await {
            Ok(page) => Ok(Box::new(ChromiumSession { page: Some(page) })),
            Err(e) => {
                if let Some(dead) = guard.take() {
                    dead.handler.abort();
                }
                Err(RenderError::Crashed(e.to_string()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn shutdown(&self) {
        if let Some(mut launched) = self.browser.lock().await.take() {
            if let Err(e) = launched.browser.close().await {
                tracing::debug!("Closing Chromium failed: {}", e);
            }
            launched.handler.abort();
            tracing::info!("Chromium shut down");
        }
    }
}

struct ChromiumSession {
    page: Option<Page>,
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn render(&mut self, request: &RenderRequest) -> Result<RenderOutput, RenderError> {
        let page = self.page.as_ref().ok_or(RenderError::SessionClosed)?;
        let deadline = Instant::now() + request.timeout;

        let navigation = async {
            page.goto(request.url.as_str()).await?;
            page.wait_for_navigation().await?;
            Ok::<_, CdpError>(())
        };
        tokio::time::timeout_at(deadline, navigation)
            .await
            .map_err(|_| RenderError::Timeout(request.timeout))?
            .map_err(|e| classify(&request.url, request.timeout, e))?;

        if let Some(selector) = &request.expected_selector {
            while page.find_element(selector.as_str()).await.is_err() {
                if Instant::now() >= deadline {
                    return Err(RenderError::NotReady {
                        url: request.url.clone(),
                        selector: selector.clone(),
                    });
                }
                tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
            }
        }

        let html = page
            .content()
            .await
            .map_err(|e| classify(&request.url, request.timeout, e))?;

        let final_url = match page.url().await.ok().flatten() {
            Some(current) => Url::parse(&current).ok(),
            None => None,
        };
        let final_url = match final_url {
            Some(url) => url,
            None => Url::parse(&request.url).map_err(|e| RenderError::Navigation {
                url: request.url.clone(),
                message: e.to_string(),
            })?,
        };

        Ok(RenderOutput {
            final_url,
            html,
            status: None,
        })
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                tracing::debug!("Closing tab failed: {}", e);
            }
        }
    }
}

fn classify(url: &str, timeout: Duration, error: CdpError) -> RenderError {
    match error {
        CdpError::Timeout => RenderError::Timeout(timeout),
        CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
            RenderError::Crashed(error.to_string())
        }
        other => RenderError::Navigation {
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}
