use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetCacheDisabledParams, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use serde_json::json;

use super::error::{BrowserError, BrowserResult};

/// Makes an automation-driven page resemble an ordinary browser:
/// realistic headers and user agent, fixed viewport, caching on, and
/// the webdriver fingerprint hidden before any endpoint script runs.
#[derive(Debug, Clone)]
pub struct StealthProfile {
    user_agent: String,
    accept_language: String,
    viewport_width: u32,
    viewport_height: u32,
}

impl StealthProfile {
    pub fn new(
        user_agent: impl Into<String>,
        accept_language: impl Into<String>,
        viewport_width: u32,
        viewport_height: u32,
    ) -> Self {
        Self {
            user_agent: user_agent.into(),
            accept_language: accept_language.into(),
            viewport_width,
            viewport_height,
        }
    }

    pub async fn apply(&self, page: &Page) -> BrowserResult<()> {
        self.apply_viewport(page).await?;
        self.apply_headers(page).await?;
        self.hide_automation_markers(page).await?;
        page.execute(SetCacheDisabledParams::new(false)).await?;
        Ok(())
    }

    async fn apply_viewport(&self, page: &Page) -> BrowserResult<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport_width as i64)
            .height(self.viewport_height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(BrowserError::Configuration)?;
        page.execute(params).await?;
        Ok(())
    }

    async fn apply_headers(&self, page: &Page) -> BrowserResult<()> {
        let params = SetUserAgentOverrideParams::builder()
            .user_agent(self.user_agent.clone())
            .accept_language(self.accept_language.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        page.execute(params).await?;

        let headers = Headers::new(json!({
            "Accept-Language": self.accept_language,
            "User-Agent": self.user_agent,
        }));
        page.execute(SetExtraHttpHeadersParams::new(headers)).await?;
        Ok(())
    }

    async fn hide_automation_markers(&self, page: &Page) -> BrowserResult<()> {
        let script = r#"
Object.defineProperty(navigator, 'webdriver', {
    get: () => undefined
});
"#;
        page.evaluate_on_new_document(
            AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(script)
                .build()
                .map_err(BrowserError::Configuration)?,
        )
        .await?;
        Ok(())
    }
}
