use regex::Regex;
use tracing::debug;

use crate::orchestrator::{ContentParser, Record};

/// Extracts records from rendered mirror timelines. The markup is
/// server-rendered and stable enough for targeted expressions; a full
/// DOM parse buys nothing here.
pub struct TimelineParser {
    item_marker: Regex,
    link: Regex,
    content: Regex,
    date: Regex,
    tag: Regex,
}

impl Default for TimelineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineParser {
    pub fn new() -> Self {
        Self {
            item_marker: Regex::new(r#"class="timeline-item[\s"]"#).expect("valid regex"),
            link: Regex::new(r#"class="tweet-link"[^>]*href="([^"]+)""#).expect("valid regex"),
            content: Regex::new(r#"(?s)class="tweet-content[^"]*"[^>]*>(.*?)</div>"#)
                .expect("valid regex"),
            date: Regex::new(r#"class="tweet-date"[^>]*>\s*<a[^>]*title="([^"]+)""#)
                .expect("valid regex"),
            tag: Regex::new(r"<[^>]+>").expect("valid regex"),
        }
    }

    fn parse_item(&self, chunk: &str) -> Option<Record> {
        // Items without a permalink are filler rows (show-more, ads).
        let link = self.link.captures(chunk)?.get(1)?.as_str().to_string();
        let id = record_id(&link)?;
        let text = self
            .content
            .captures(chunk)
            .and_then(|caps| caps.get(1))
            .map(|m| self.strip_markup(m.as_str()))
            .unwrap_or_default();
        let timestamp = self
            .date
            .captures(chunk)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        Some(Record {
            id,
            text,
            timestamp,
            link: Some(link),
            screenshot: None,
        })
    }

    fn strip_markup(&self, fragment: &str) -> String {
        let text = self.tag.replace_all(fragment, "");
        text.replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .trim()
            .to_string()
    }
}

impl ContentParser for TimelineParser {
    fn parse(&self, markup: &str) -> Vec<Record> {
        let starts: Vec<usize> = self.item_marker.find_iter(markup).map(|m| m.start()).collect();
        let mut records = Vec::new();
        for (index, &start) in starts.iter().enumerate() {
            let end = starts.get(index + 1).copied().unwrap_or(markup.len());
            if let Some(record) = self.parse_item(&markup[start..end]) {
                records.push(record);
            }
        }
        debug!(items = starts.len(), records = records.len(), "timeline parsed");
        records
    }
}

/// The record id is the last path segment of the permalink, minus any
/// fragment or query suffix.
fn record_id(link: &str) -> Option<String> {
    let segment = link.rsplit('/').next()?;
    let id = segment
        .split('#')
        .next()?
        .split('?')
        .next()?
        .trim()
        .to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
