use std::path::Path;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::Page;
use tracing::{debug, info, warn};

use super::error::BrowserResult;

// Light theme overrides so captured items stay legible outside the page.
const STYLE_OVERRIDES: &str = r##"
document.body.style.setProperty("--bg_panel", "#fff !important");
document.body.style.setProperty("--fg_color", "#010101 !important");
document.body.style.setProperty("--border_grey", "#ebeaea !important");
"##;

/// Captures one PNG per content item found on the rendered page, named
/// by item id. Best effort throughout: a failed capture is logged and
/// skipped, and the fetch that triggered it never fails because of it.
pub(super) async fn capture_items(
    page: &Page,
    selector: &str,
    output_dir: &Path,
) -> BrowserResult<usize> {
    tokio::fs::create_dir_all(output_dir).await?;

    let ids = item_ids(page, selector).await?;
    let elements = page.find_elements(selector).await?;
    let total = elements.len();
    if total == 0 {
        debug!("no content items found for screenshot capture");
        return Ok(0);
    }
    info!(items = total, "capturing content item screenshots");

    if let Err(err) = page.evaluate(STYLE_OVERRIDES).await {
        warn!(error = %err, "failed to apply screenshot style overrides");
    }

    let mut captured = 0usize;
    for (index, element) in elements.iter().enumerate() {
        let Some(id) = ids.get(index).and_then(|id| id.as_deref()) else {
            warn!(index, "content item has no id, skipping screenshot");
            continue;
        };
        let path = output_dir.join(format!("{id}.png"));
        if path.exists() {
            debug!(item = %id, "screenshot already captured");
            captured += 1;
            continue;
        }
        match element.screenshot(CaptureScreenshotFormat::Png).await {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(&path, bytes).await {
                    warn!(item = %id, error = %err, "failed to write screenshot");
                    continue;
                }
                captured += 1;
            }
            Err(err) => {
                warn!(item = %id, index, error = %err, "failed to capture item screenshot");
            }
        }
    }
    info!(captured, total, "screenshot capture finished");
    Ok(captured)
}

/// Pulls the id of each content item: the last path segment of its
/// permalink, stripped of fragments and query strings.
async fn item_ids(page: &Page, selector: &str) -> BrowserResult<Vec<Option<String>>> {
    let script = format!(
        r#"
Array.from(document.querySelectorAll('{selector}')).map((item) => {{
    const link = item.querySelector('.tweet-link');
    if (!link || !link.href) {{
        return null;
    }}
    const raw = link.href.split('/').pop() || '';
    const id = raw.split('#')[0].split('?')[0];
    return id.length > 0 ? id : null;
}})
"#
    );
    let ids: Vec<Option<String>> = page
        .evaluate(script)
        .await?
        .into_value()
        .map_err(|err| super::error::BrowserError::Cdp(err.to_string()))?;
    Ok(ids)
}
