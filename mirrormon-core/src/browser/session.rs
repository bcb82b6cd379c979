use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{ChromeSection, FetchSection};
use crate::registry::unix_now;

use super::error::{BrowserError, BrowserResult};
use super::interception::{spawn_interception, InterceptionPolicy};
use super::screenshot;
use super::stealth::StealthProfile;

/// External collaborator that reaps stray remote-debugging sessions.
/// Invoked best effort during shutdown; implementations log their own
/// failures and never propagate them.
#[async_trait]
pub trait SessionCleanup: Send + Sync {
    async fn cleanup(&self, host: &str, port: u16);
}

/// Default cleanup collaborator: enumerates sessions over the
/// remote-debugging HTTP surface and closes them one by one.
#[derive(Debug, Default)]
pub struct HttpSessionCleanup {
    http: reqwest::Client,
}

#[async_trait]
impl SessionCleanup for HttpSessionCleanup {
    async fn cleanup(&self, host: &str, port: u16) {
        let list_url = format!("http://{host}:{port}/json");
        let sessions: Vec<serde_json::Value> = match self.http.get(&list_url).send().await {
            Ok(response) => response.json().await.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "failed to enumerate chrome sessions");
                return;
            }
        };
        let mut closed = 0usize;
        for session in &sessions {
            let Some(id) = session.get("id").and_then(|id| id.as_str()) else {
                continue;
            };
            let close_url = format!("http://{host}:{port}/json/close/{id}");
            match self.http.get(&close_url).send().await {
                Ok(response) if response.status().is_success() => closed += 1,
                Ok(response) => {
                    warn!(session = %id, status = %response.status(), "failed to close chrome session")
                }
                Err(err) => warn!(session = %id, error = %err, "failed to close chrome session"),
            }
        }
        info!(closed, total = sessions.len(), "stray chrome sessions cleaned up");
    }
}

/// Owns the single remote browser automation connection and its
/// lifecycle. Never shared: the host holds one handle and passes it to
/// the shutdown routine directly.
pub struct BrowserSessionManager {
    chrome: ChromeSection,
    stealth: StealthProfile,
    policy: InterceptionPolicy,
    content_selector: String,
    navigation_timeout: Duration,
    content_timeout: Duration,
    screenshots_dir: PathBuf,
    cleanup: Option<Arc<dyn SessionCleanup>>,
    http: reqwest::Client,
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    closed: bool,
    last_health_check: f64,
    last_liveness: bool,
}

impl BrowserSessionManager {
    pub fn new(chrome: ChromeSection, fetch: &FetchSection, screenshots_dir: PathBuf) -> Self {
        let stealth = StealthProfile::new(
            fetch.user_agent.clone(),
            fetch.accept_language.clone(),
            fetch.viewport_width,
            fetch.viewport_height,
        );
        let policy = InterceptionPolicy::new(fetch.probe_script.clone());
        Self {
            chrome,
            stealth,
            policy,
            content_selector: fetch.content_selector.clone(),
            navigation_timeout: Duration::from_secs(fetch.navigation_timeout_seconds),
            content_timeout: Duration::from_secs(fetch.content_timeout_seconds),
            screenshots_dir,
            cleanup: None,
            http: reqwest::Client::new(),
            browser: None,
            handler_task: None,
            page: None,
            closed: false,
            last_health_check: 0.0,
            last_liveness: false,
        }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn SessionCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resolves the remote debugging endpoint and opens the one
    /// automation connection, retrying a few times before giving up
    /// with the last underlying cause.
    pub async fn connect(&mut self) -> BrowserResult<()> {
        if self.closed {
            return Err(BrowserError::Connection(
                "session manager is closed; create a fresh one".into(),
            ));
        }
        let attempts = self.chrome.connect_attempts.max(1);
        let retry_delay = Duration::from_millis(self.chrome.connect_retry_delay_ms);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(()) => {
                    info!(attempt, "connected to remote chrome");
                    self.last_liveness = true;
                    self.last_health_check = unix_now();
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "chrome connection attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        sleep(retry_delay).await;
                    }
                }
            }
        }
        let cause = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".into());
        Err(BrowserError::Connection(format!(
            "chrome unreachable after {attempts} attempts: {cause}"
        )))
    }

    async fn try_connect(&mut self) -> BrowserResult<()> {
        let ws_endpoint = self.discover_ws_endpoint().await?;
        info!(endpoint = %ws_endpoint, "connecting to remote chrome");
        let (browser, mut handler) = Browser::connect(ws_endpoint).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chrome handler reported error");
                }
            }
        });
        // Liveness check before accepting the connection.
        browser.pages().await?;
        self.browser = Some(browser);
        self.handler_task = Some(handler_task);
        Ok(())
    }

    /// `GET /json/version`, then rewrite the advertised websocket URL
    /// so its host segment carries the configured port.
    async fn discover_ws_endpoint(&self) -> BrowserResult<String> {
        let url = format!(
            "http://{}:{}/json/version",
            self.chrome.host, self.chrome.port
        );
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(self.chrome.discovery_timeout_seconds))
            .send()
            .await
            .map_err(|err| BrowserError::Discovery(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            return Err(BrowserError::Discovery(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| BrowserError::Discovery(format!("{url}: {err}")))?;
        let ws_url = body
            .get("webSocketDebuggerUrl")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                BrowserError::Discovery("version response missing webSocketDebuggerUrl".into())
            })?;
        let mut rewritten = url::Url::parse(ws_url)
            .map_err(|err| BrowserError::Discovery(format!("bad websocket url {ws_url}: {err}")))?;
        rewritten
            .set_port(Some(self.chrome.port))
            .map_err(|_| BrowserError::Discovery(format!("cannot set port on {ws_url}")))?;
        Ok(rewritten.to_string())
    }

    /// Cheap liveness probe: enumerate open pages.
    pub async fn is_connected(&self) -> bool {
        if self.closed {
            return false;
        }
        match &self.browser {
            Some(browser) => browser.pages().await.is_ok(),
            None => false,
        }
    }

    /// Rate-limited health check. Inside the interval this returns the
    /// last known liveness without probing; once the interval elapses a
    /// failed probe triggers a full reconnect (close, then connect).
    pub async fn check_connection(&mut self) -> bool {
        let now = unix_now();
        let interval = self.chrome.health_check_interval_seconds as f64;
        if now - self.last_health_check < interval {
            return self.last_liveness;
        }
        self.last_health_check = now;

        if self.is_connected().await {
            self.last_liveness = true;
            return true;
        }
        if self.closed {
            self.last_liveness = false;
            return false;
        }

        warn!("chrome connection lost, attempting reconnect");
        self.disconnect().await;
        match self.connect().await {
            Ok(()) => {
                self.last_liveness = self.is_connected().await;
            }
            Err(err) => {
                warn!(error = %err, "chrome reconnect failed");
                self.last_liveness = false;
            }
        }
        self.last_liveness
    }

    /// Renders `endpoint/target` and returns the full markup. The page
    /// opened here is scoped to this call and closed on every exit
    /// path; leaked pages would exhaust the remote browser.
    pub async fn fetch(&mut self, endpoint: &str, target: &str) -> BrowserResult<String> {
        if !self.check_connection().await {
            return Err(BrowserError::Connection(
                "chrome connection unavailable".into(),
            ));
        }

        let page = {
            let browser = self
                .browser
                .as_ref()
                .ok_or_else(|| BrowserError::Connection("not connected".into()))?;
            browser
                .new_page(CreateTargetParams::new("about:blank"))
                .await?
        };
        self.page = Some(page.clone());

        let result = self.render(&page, endpoint, target).await;

        // Guaranteed cleanup; closing the page also ends the
        // interception task listening on it.
        if let Err(err) = page.close().await {
            debug!(error = %err, "failed to close fetch page");
        }
        self.page = None;

        if let Err(err) = &result {
            if err.is_connection_lost() {
                warn!("connection dropped mid-fetch, forcing reconnect on next use");
                self.disconnect().await;
                self.last_liveness = false;
                self.last_health_check = 0.0;
            }
        }
        result
    }

    async fn render(&self, page: &Page, endpoint: &str, target: &str) -> BrowserResult<String> {
        self.stealth.apply(page).await?;
        let _interception = spawn_interception(page, self.policy.clone()).await?;

        let url = format!("{}/{}", endpoint.trim_end_matches('/'), target);
        info!(url = %url, "rendering page");
        let navigation = timeout(self.navigation_timeout, async {
            page.goto(url.as_str()).await?;
            page.wait_for_navigation().await?;
            Ok::<_, BrowserError>(())
        })
        .await;
        match navigation {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(BrowserError::NavigationTimeout(format!(
                    "page load exceeded {}s for {url}",
                    self.navigation_timeout.as_secs()
                )))
            }
        }

        self.wait_for_content(page).await?;
        let markup = page.content().await?;

        // Best-effort side task; a screenshot failure never fails the fetch.
        if let Err(err) =
            screenshot::capture_items(page, &self.content_selector, &self.screenshots_dir).await
        {
            warn!(error = %err, "screenshot capture failed");
        }

        Ok(markup)
    }

    /// Bounded wait for the content-ready marker.
    async fn wait_for_content(&self, page: &Page) -> BrowserResult<()> {
        let deadline = tokio::time::Instant::now() + self.content_timeout;
        loop {
            match page.find_element(self.content_selector.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    let classified = BrowserError::from(err);
                    if classified.is_connection_lost() || classified.is_anti_automation() {
                        return Err(classified);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::NavigationTimeout(format!(
                    "content marker '{}' not found within {}s",
                    self.content_selector,
                    self.content_timeout.as_secs()
                )));
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    /// Idempotent terminal shutdown: closes everything the connection
    /// knows about, runs the external cleanup collaborator best effort,
    /// and clears all handles.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.last_liveness = false;
        self.disconnect().await;
        if let Some(cleanup) = self.cleanup.clone() {
            cleanup.cleanup(&self.chrome.host, self.chrome.port).await;
        }
        info!("chrome session closed");
    }

    /// Tears down connection handles without marking the manager
    /// closed, so `connect()` can be called again (reconnect path).
    async fn disconnect(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(err) = page.close().await {
                debug!(error = %err, "failed to close active page");
            }
        }
        if let Some(mut browser) = self.browser.take() {
            if let Ok(pages) = browser.pages().await {
                for page in pages {
                    if let Err(err) = page.close().await {
                        debug!(error = %err, "failed to close child page");
                    }
                }
            }
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close chrome connection gracefully");
            }
        }
        if let Some(handle) = self.handler_task.take() {
            if timeout(Duration::from_secs(2), handle).await.is_err() {
                debug!("chrome handler task did not finish promptly");
            }
        }
    }
}

impl std::fmt::Debug for BrowserSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSessionManager")
            .field("host", &self.chrome.host)
            .field("port", &self.chrome.port)
            .field("connected", &self.browser.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}
