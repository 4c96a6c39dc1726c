use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams, RequestId, ResourceType,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::{FutureExt, StreamExt};
use tempfile::TempDir;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::links::Link;
use crate::settings::Settings;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Xhr,
    Fetch,
}

/// One background response observed while a page loaded.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub url: String,
    pub kind: ResourceKind,
    /// `None` when the browser could not hand the body back.
    pub body: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("browser protocol error: {0}")]
    Protocol(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("`{selector}` did not appear within {}s", .waited.as_secs())]
    NotReady { selector: String, waited: Duration },
}

impl From<CdpError> for FetchError {
    fn from(err: CdpError) -> Self {
        FetchError::Protocol(err.to_string())
    }
}

/// Visits a post page and hands back the background responses it produced.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, link: &Link) -> Result<Vec<ResponseRecord>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub ready_selector: String,
    pub ready_timeout: Duration,
    pub chrome_path: Option<PathBuf>,
    pub sandbox: bool,
    /// Only responses whose URL contains this get their body fetched.
    pub body_marker: Option<String>,
}

impl From<&Settings> for FetchOptions {
    fn from(s: &Settings) -> Self {
        FetchOptions {
            headless: s.headless,
            viewport_width: s.viewport_width,
            viewport_height: s.viewport_height,
            ready_selector: s.ready_selector.clone(),
            ready_timeout: s.ready_timeout(),
            chrome_path: s.chrome_path.clone(),
            sandbox: s.sandbox,
            body_marker: Some(s.endpoint_marker.clone()),
        }
    }
}

/// Headless Chromium driven over CDP. Every visit gets its own browser
/// process and throwaway profile.
pub struct ChromeFetcher {
    options: FetchOptions,
}

impl ChromeFetcher {
    pub fn new(options: FetchOptions) -> Self {
        ChromeFetcher { options }
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn fetch(&self, link: &Link) -> Result<Vec<ResponseRecord>, FetchError> {
        let mut session = BrowserSession::launch(&self.options).await?;
        let visited = visit(&session.browser, link, &self.options).await;
        session.close().await;
        visited
    }
}

async fn visit(
    browser: &Browser,
    link: &Link,
    opts: &FetchOptions,
) -> Result<Vec<ResponseRecord>, FetchError> {
    let page = browser.new_page("about:blank").await?;
    page.execute(EnableParams::default()).await?;

    // Subscribe before navigating so nothing issued during load is missed.
    let mut events = page.event_listener::<EventResponseReceived>().await?;

    page.goto(link.as_str())
        .await
        .map_err(|e| FetchError::Navigation {
            url: link.to_string(),
            message: e.to_string(),
        })?;
    wait_for_selector(&page, &opts.ready_selector, opts.ready_timeout).await?;

    let mut observed = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        let kind = match event.r#type {
            ResourceType::Xhr => ResourceKind::Xhr,
            ResourceType::Fetch => ResourceKind::Fetch,
            _ => continue,
        };
        observed.push((event.request_id.clone(), event.response.url.clone(), kind));
    }
    debug!("{}: {} background responses", link, observed.len());

    let mut records = Vec::with_capacity(observed.len());
    for (request_id, url, kind) in observed {
        let body = if wants_body(&url, opts.body_marker.as_deref()) {
            response_body(&page, request_id, &url).await
        } else {
            None
        };
        records.push(ResponseRecord { url, kind, body });
    }

    if let Err(e) = page.close().await {
        debug!("Failed to close page for {}: {}", link, e);
    }
    Ok(records)
}

fn wants_body(url: &str, marker: Option<&str>) -> bool {
    marker.map_or(true, |m| url.contains(m))
}

async fn response_body(page: &Page, request_id: RequestId, url: &str) -> Option<String> {
    match page.execute(GetResponseBodyParams::new(request_id)).await {
        Ok(resp) if resp.result.base64_encoded => {
            debug!("Skipping binary body for {}", url);
            None
        }
        Ok(resp) => Some(resp.result.body),
        Err(e) => {
            debug!("No body for {}: {}", url, e);
            None
        }
    }
}

async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> Result<(), FetchError> {
    let start = Instant::now();
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(FetchError::NotReady {
                selector: selector.to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// A launched browser plus the task pumping its CDP connection.
///
/// Dropping the session (visit timed out or was cancelled) aborts the handler
/// and drops the `Browser`, which kills the child process; the profile
/// directory is removed with it.
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    _profile: TempDir,
}

impl BrowserSession {
    async fn launch(opts: &FetchOptions) -> Result<Self, FetchError> {
        let profile = tempfile::Builder::new()
            .prefix("tweet-scraper-")
            .tempdir()
            .map_err(|e| FetchError::Launch(format!("profile dir: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .window_size(opts.viewport_width, opts.viewport_height)
            .viewport(Viewport {
                width: opts.viewport_width,
                height: opts.viewport_height,
                ..Default::default()
            })
            .user_data_dir(profile.path());
        if !opts.sandbox {
            builder = builder.no_sandbox();
        }
        if !opts.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &opts.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(FetchError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }
        });

        Ok(BrowserSession {
            browser,
            handler,
            _profile: profile,
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
        if let Err(e) = self.browser.wait().await {
            debug!("Browser did not exit cleanly: {}", e);
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodies_are_fetched_only_for_marked_responses() {
        let marker = Some("TweetResultByRestId");
        assert!(wants_body(
            "https://x.com/i/api/graphql/abc/TweetResultByRestId?variables=%7B%7D",
            marker
        ));
        assert!(!wants_body("https://x.com/i/api/1.1/jot/client_event.json", marker));
        assert!(wants_body("https://x.com/i/api/1.1/jot/client_event.json", None));
    }

    #[test]
    fn options_follow_settings() {
        let settings = Settings {
            sandbox: false,
            endpoint_marker: "TweetDetail".to_string(),
            ..Default::default()
        };
        let opts = FetchOptions::from(&settings);
        assert!(!opts.sandbox);
        assert_eq!(opts.body_marker.as_deref(), Some("TweetDetail"));
        assert!(FetchOptions::from(&Settings::default()).sandbox);
    }
}
