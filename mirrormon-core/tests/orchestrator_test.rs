use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use mirrormon_core::config::RegistrySection;
use mirrormon_core::{
    BrowserError, BrowserResult, ContentParser, EndpointHealthRegistry, FetchOrchestrator,
    MarkupFetcher, Record,
};

fn registry_with_seeds(dir: &TempDir, seeds: &[&str]) -> EndpointHealthRegistry {
    let section = RegistrySection {
        seed_endpoints: seeds.iter().map(|s| s.to_string()).collect(),
        roster_url: "https://roster.example/list.md".into(),
        refresh_interval_seconds: 86_400,
        reuse_interval_seconds: 20,
        retention_days: 7,
        snapshot_file: "endpoint_health.json".into(),
    };
    EndpointHealthRegistry::open(&section, dir.path().join("endpoint_health.json"))
}

struct MockFetcher {
    responses: VecDeque<BrowserResult<String>>,
    calls: Vec<(String, String)>,
}

impl MockFetcher {
    fn new(responses: Vec<BrowserResult<String>>) -> Self {
        Self {
            responses: responses.into(),
            calls: Vec::new(),
        }
    }
}

#[async_trait]
impl MarkupFetcher for MockFetcher {
    async fn fetch(&mut self, endpoint: &str, target: &str) -> BrowserResult<String> {
        self.calls.push((endpoint.to_string(), target.to_string()));
        self.responses
            .pop_front()
            .unwrap_or_else(|| Err(BrowserError::Connection("exhausted".into())))
    }
}

/// Emits one record per `timeline-item` marker in the markup.
struct MarkerParser;

impl ContentParser for MarkerParser {
    fn parse(&self, markup: &str) -> Vec<Record> {
        markup
            .match_indices("timeline-item")
            .enumerate()
            .map(|(index, _)| Record {
                id: format!("17000000{index}"),
                text: format!("record {index}"),
                timestamp: None,
                link: None,
                screenshot: None,
            })
            .collect()
    }
}

fn orchestrator(
    registry: EndpointHealthRegistry,
    fetcher: MockFetcher,
    dir: &TempDir,
) -> FetchOrchestrator<MockFetcher> {
    FetchOrchestrator::new(
        registry,
        fetcher,
        Arc::new(MarkerParser),
        dir.path().join("screenshots"),
        5,
    )
}

#[tokio::test(start_paused = true)]
async fn successful_fetch_reports_success_and_attaches_screenshots() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_seeds(&dir, &["https://mirror-a.example"]);
    let fetcher = MockFetcher::new(vec![Ok(
        "<div class=\"timeline-item\">hello</div>".to_string()
    )]);
    let mut orchestrator = orchestrator(registry, fetcher, &dir);

    let records = orchestrator.fetch_records("someone").await;
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].screenshot,
        Some(dir.path().join("screenshots").join("170000000.png"))
    );

    let health = orchestrator
        .registry()
        .health("https://mirror-a.example")
        .unwrap();
    assert_eq!(health.success_count, 1);
    assert_eq!(health.fail_count, 0);
    assert_eq!(health.cooldown_until, 0.0);

    assert_eq!(orchestrator.session_mut().calls.len(), 1);
    assert_eq!(
        orchestrator.session_mut().calls[0],
        ("https://mirror-a.example".to_string(), "someone".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn exhausts_budget_and_returns_empty_when_no_endpoint_is_usable() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = registry_with_seeds(&dir, &["https://mirror-a.example"]);
    // Put the only endpoint into a 60 s cooldown.
    registry.report_outcome("https://mirror-a.example", false);

    let fetcher = MockFetcher::new(vec![]);
    let mut orchestrator = orchestrator(registry, fetcher, &dir);

    let records = orchestrator.fetch_records("someone").await;
    assert!(records.is_empty());
    // The session was never asked to navigate.
    assert!(orchestrator.session_mut().calls.is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_markup_counts_as_failure_and_retries() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_seeds(
        &dir,
        &["https://mirror-a.example", "https://mirror-b.example"],
    );
    let fetcher = MockFetcher::new(vec![
        Ok("<html>no items here</html>".to_string()),
        Ok("<div class=\"timeline-item\"></div>".to_string()),
    ]);
    let mut orchestrator = orchestrator(registry, fetcher, &dir);

    let records = orchestrator.fetch_records("someone").await;
    assert_eq!(records.len(), 1);
    assert_eq!(orchestrator.session_mut().calls.len(), 2);
    // Both endpoints were used: one failed, one succeeded.
    let scores: Vec<u64> = ["https://mirror-a.example", "https://mirror-b.example"]
        .iter()
        .map(|url| {
            let health = orchestrator.registry().health(url).unwrap();
            health.success_count + health.fail_count
        })
        .collect();
    assert_eq!(scores.iter().sum::<u64>(), 2);
}

#[tokio::test(start_paused = true)]
async fn anti_automation_penalizes_the_endpoint_and_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_seeds(
        &dir,
        &["https://mirror-a.example", "https://mirror-b.example"],
    );
    let fetcher = MockFetcher::new(vec![
        Err(BrowserError::AntiAutomation(
            "Maximum call stack size exceeded".into(),
        )),
        Ok("<div class=\"timeline-item\"></div>".to_string()),
    ]);
    let mut orchestrator = orchestrator(registry, fetcher, &dir);

    let records = orchestrator.fetch_records("someone").await;
    assert_eq!(records.len(), 1);
    assert_eq!(orchestrator.session_mut().calls.len(), 2);

    // The defended endpoint took the cold-failure penalty, the other
    // one recorded the success.
    let mut healths: Vec<i64> = ["https://mirror-a.example", "https://mirror-b.example"]
        .iter()
        .map(|url| orchestrator.registry().health(url).unwrap().health_score)
        .collect();
    healths.sort_unstable();
    assert_eq!(healths, vec![80, 100]);
}

#[tokio::test(start_paused = true)]
async fn every_attempt_failing_yields_empty_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_seeds(
        &dir,
        &[
            "https://mirror-a.example",
            "https://mirror-b.example",
            "https://mirror-c.example",
            "https://mirror-d.example",
            "https://mirror-e.example",
        ],
    );
    let fetcher = MockFetcher::new(vec![
        Err(BrowserError::NavigationTimeout("slow".into())),
        Err(BrowserError::ConnectionLost("Connection is closed".into())),
        Err(BrowserError::Connection("chrome unreachable".into())),
        Err(BrowserError::NavigationTimeout("slow again".into())),
        Err(BrowserError::Cdp("node not found".into())),
    ]);
    let mut orchestrator = orchestrator(registry, fetcher, &dir);

    let records = orchestrator.fetch_records("someone").await;
    assert!(records.is_empty());
    assert_eq!(orchestrator.session_mut().calls.len(), 5);
}
