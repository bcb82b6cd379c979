use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EventRequestPaused, FailRequestParams, FulfillRequestParams,
    HeaderEntry,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::BrowserResult;

/// What to do with one intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    Allow,
    Block,
    FakeEmptyResponse,
}

/// Pure per-request policy: heavy resources are blocked outright, the
/// known anti-automation probe script gets an empty response, and
/// everything else passes through.
#[derive(Debug, Clone)]
pub struct InterceptionPolicy {
    probe_script: String,
}

impl InterceptionPolicy {
    pub fn new(probe_script: impl Into<String>) -> Self {
        Self {
            probe_script: probe_script.into(),
        }
    }

    pub fn decide(&self, url: &str, resource_type: &ResourceType) -> RequestDecision {
        if matches!(
            resource_type,
            ResourceType::Image | ResourceType::Media | ResourceType::Font
        ) {
            return RequestDecision::Block;
        }
        if !self.probe_script.is_empty() && url.contains(&self.probe_script) {
            return RequestDecision::FakeEmptyResponse;
        }
        RequestDecision::Allow
    }
}

/// Drives the interception policy over the CDP Fetch domain for one
/// page. The returned task ends when the page goes away.
pub(super) async fn spawn_interception(
    page: &Page,
    policy: InterceptionPolicy,
) -> BrowserResult<JoinHandle<()>> {
    let mut events = page.event_listener::<EventRequestPaused>().await?;
    let page = page.clone();
    page.execute(chromiumoxide::cdp::browser_protocol::fetch::EnableParams::default())
        .await?;

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let request_id = event.request_id.clone();
            let url = event.request.url.clone();
            let resource_type = event.resource_type.clone();
            let outcome = match policy.decide(&url, &resource_type) {
                RequestDecision::Allow => page
                    .execute(ContinueRequestParams::new(request_id))
                    .await
                    .map(|_| ()),
                RequestDecision::Block => {
                    debug!(url = %url, kind = ?resource_type, "blocking heavy resource");
                    page.execute(FailRequestParams::new(request_id, ErrorReason::BlockedByClient))
                        .await
                        .map(|_| ())
                }
                RequestDecision::FakeEmptyResponse => {
                    debug!(url = %url, "substituting empty response for probe script");
                    let params = FulfillRequestParams::builder()
                        .request_id(request_id)
                        .response_code(200)
                        .response_header(HeaderEntry {
                            name: "content-type".into(),
                            value: "application/javascript".into(),
                        })
                        .body(BASE64.encode(""))
                        .build();
                    match params {
                        Ok(params) => page.execute(params).await.map(|_| ()),
                        Err(err) => {
                            warn!(error = %err, "failed to build fulfill params");
                            page.execute(ContinueRequestParams::new(event.request_id.clone()))
                                .await
                                .map(|_| ())
                        }
                    }
                }
            };
            if let Err(err) = outcome {
                // The page closing mid-flight is routine here.
                debug!(url = %url, error = %err, "interception action failed");
            }
        }
    }))
}
