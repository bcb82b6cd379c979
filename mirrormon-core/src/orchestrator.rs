use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::browser::{BrowserResult, BrowserSessionManager};
use crate::registry::EndpointHealthRegistry;

const NO_ENDPOINT_PAUSE: Duration = Duration::from_secs(5);
const FAILURE_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// One structured content item extracted from rendered markup.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Record {
    pub id: String,
    pub text: String,
    pub timestamp: Option<String>,
    pub link: Option<String>,
    pub screenshot: Option<PathBuf>,
}

/// External collaborator turning rendered markup into records. Pure
/// parsing concern; its internals are outside the engine.
pub trait ContentParser: Send + Sync {
    fn parse(&self, markup: &str) -> Vec<Record>;
}

/// Seam over the session manager so the retry loop is testable without
/// a live browser.
#[async_trait]
pub trait MarkupFetcher: Send {
    async fn fetch(&mut self, endpoint: &str, target: &str) -> BrowserResult<String>;
}

#[async_trait]
impl MarkupFetcher for BrowserSessionManager {
    async fn fetch(&mut self, endpoint: &str, target: &str) -> BrowserResult<String> {
        BrowserSessionManager::fetch(self, endpoint, target).await
    }
}

/// The retry loop tying registry and session together: select an
/// endpoint, render, interpret the outcome, report back, and decide
/// whether to retry, back off, or give up.
pub struct FetchOrchestrator<F: MarkupFetcher> {
    registry: EndpointHealthRegistry,
    session: F,
    parser: Arc<dyn ContentParser>,
    screenshots_dir: PathBuf,
    max_attempts: usize,
}

impl<F: MarkupFetcher> FetchOrchestrator<F> {
    pub fn new(
        registry: EndpointHealthRegistry,
        session: F,
        parser: Arc<dyn ContentParser>,
        screenshots_dir: PathBuf,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            session,
            parser,
            screenshots_dir,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn registry(&self) -> &EndpointHealthRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut EndpointHealthRegistry {
        &mut self.registry
    }

    pub fn session_mut(&mut self) -> &mut F {
        &mut self.session
    }

    /// Fetches `target` through the healthiest available endpoints,
    /// retrying up to the attempt budget. Every failure inside an
    /// attempt is classified, reported to the registry, logged and
    /// absorbed; an exhausted budget yields an empty result, never an
    /// error.
    pub async fn fetch_records(&mut self, target: &str) -> Vec<Record> {
        for attempt in 0..self.max_attempts {
            let Some(endpoint) = self.registry.select() else {
                warn!(attempt, "no usable endpoint, pausing before next attempt");
                sleep(NO_ENDPOINT_PAUSE).await;
                continue;
            };

            match self.session.fetch(&endpoint, target).await {
                Ok(markup) => {
                    let mut records = self.parser.parse(&markup);
                    if !records.is_empty() {
                        for record in &mut records {
                            record.screenshot =
                                Some(self.screenshots_dir.join(format!("{}.png", record.id)));
                        }
                        self.registry.report_outcome(&endpoint, true);
                        info!(
                            endpoint = %endpoint,
                            target,
                            records = records.len(),
                            "fetch succeeded"
                        );
                        return records;
                    }
                    warn!(endpoint = %endpoint, target, "rendered page produced no records");
                    self.registry.report_outcome(&endpoint, false);
                }
                Err(err) if err.is_anti_automation() => {
                    // Endpoint-specific defense: penalize the endpoint,
                    // leave the session alone.
                    warn!(endpoint = %endpoint, target, error = %err, "anti-automation defense detected");
                    self.registry.report_outcome(&endpoint, false);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, target, error = %err, "fetch attempt failed");
                    self.registry.report_outcome(&endpoint, false);
                }
            }

            if attempt + 1 < self.max_attempts {
                sleep(FAILURE_BACKOFF_STEP * (attempt as u32 + 1)).await;
            }
        }
        warn!(
            target,
            attempts = self.max_attempts,
            "fetch budget exhausted without content"
        );
        Vec::new()
    }
}
