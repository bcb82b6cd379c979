mod roster;
mod snapshot;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RegistrySection;

pub use roster::parse_roster;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("roster fetch failed: {0}")]
    Discovery(String),
    #[error("snapshot io error: {0}")]
    Snapshot(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-endpoint reliability state, persisted in the health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub success_count: u64,
    pub fail_count: u64,
    pub last_success: Option<f64>,
    pub last_failure: Option<f64>,
    pub health_score: i64,
    pub cooldown_until: f64,
    pub last_update: f64,
}

impl EndpointHealth {
    fn new(now: f64) -> Self {
        Self {
            success_count: 0,
            fail_count: 0,
            last_success: None,
            last_failure: None,
            health_score: 100,
            cooldown_until: 0.0,
            last_update: now,
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.fail_count;
        if total == 0 {
            50.0
        } else {
            self.success_count as f64 / total as f64 * 100.0
        }
    }
}

// Selection weights and the 300 s staleness normalization are tuned
// heuristics carried over from production behavior, not derived values.
const WEIGHT_HEALTH: f64 = 0.5;
const WEIGHT_STALENESS: f64 = 0.3;
const WEIGHT_SUCCESS_RATE: f64 = 0.2;
const STALENESS_NORMALIZATION_SECONDS: f64 = 300.0;

const SUCCESS_REWARD: i64 = 5;
const RECENT_SUCCESS_WINDOW_SECONDS: f64 = 24.0 * 3600.0;

/// Owns the candidate endpoint set, per-endpoint health state and the
/// selection algorithm. Single-writer: callers must serialize access.
#[derive(Debug)]
pub struct EndpointHealthRegistry {
    seed_endpoints: Vec<String>,
    roster_url: String,
    reuse_interval: f64,
    retention_days: u32,
    snapshot_path: PathBuf,
    status: HashMap<String, EndpointHealth>,
    last_used: HashMap<String, f64>,
}

impl EndpointHealthRegistry {
    /// Loads the persisted snapshot (missing or unreadable files start
    /// empty) and seeds the candidate set.
    pub fn open(section: &RegistrySection, snapshot_path: PathBuf) -> Self {
        let status = snapshot::load(&snapshot_path);
        let mut registry = Self {
            seed_endpoints: section
                .seed_endpoints
                .iter()
                .map(|url| normalize_endpoint(url))
                .collect(),
            roster_url: section.roster_url.clone(),
            reuse_interval: section.reuse_interval_seconds as f64,
            retention_days: section.retention_days,
            snapshot_path,
            status,
            last_used: HashMap::new(),
        };
        registry.merge_endpoints(registry.seed_endpoints.clone(), unix_now());
        info!(
            endpoints = registry.status.len(),
            "endpoint health registry loaded"
        );
        registry
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    pub fn health(&self, endpoint: &str) -> Option<&EndpointHealth> {
        self.status.get(endpoint)
    }

    /// Endpoints ordered by health score, best first.
    pub fn top_endpoints(&self, limit: usize) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .status
            .iter()
            .map(|(url, health)| (url.clone(), health.health_score))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }

    /// Picks the best currently usable endpoint, or `None` when every
    /// candidate is cooling down, dead, or inside the reuse interval.
    /// Callers must not substitute an arbitrary endpoint for `None`.
    pub fn select(&mut self) -> Option<String> {
        self.select_at(unix_now())
    }

    pub(crate) fn select_at(&mut self, now: f64) -> Option<String> {
        let mut available: Vec<&str> = Vec::new();
        for (url, health) in &self.status {
            if health.cooldown_until > now {
                debug!(
                    endpoint = %url,
                    remaining_s = (health.cooldown_until - now) as u64,
                    "endpoint cooling down"
                );
                continue;
            }
            if health.health_score <= 0 {
                debug!(endpoint = %url, "endpoint health exhausted");
                continue;
            }
            let last_used = self.last_used.get(url).copied().unwrap_or(0.0);
            if now - last_used < self.reuse_interval {
                debug!(endpoint = %url, "endpoint inside reuse interval");
                continue;
            }
            available.push(url);
        }

        if available.is_empty() {
            warn!("no usable endpoint available");
            return None;
        }

        let best = available
            .into_iter()
            .map(|url| (url, self.score(url, now)))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        // The reuse filter already ran, but a caller racing select
        // against its own bookkeeping can still surface a negative
        // score; treat that the same as an empty candidate set.
        if best.1 < 0.0 {
            warn!("every surviving endpoint scored negative, skipping selection");
            return None;
        }

        let selected = best.0.to_string();
        self.last_used.insert(selected.clone(), now);
        info!(
            endpoint = %selected,
            score = format!("{:.1}", best.1),
            health = self.status[&selected].health_score,
            "endpoint selected"
        );
        Some(selected)
    }

    fn score(&self, endpoint: &str, now: f64) -> f64 {
        let health = &self.status[endpoint];
        let last_used = self.last_used.get(endpoint).copied().unwrap_or(0.0);
        let since_last_use = now - last_used;
        if since_last_use < self.reuse_interval {
            return -1.0;
        }
        let staleness = (since_last_use / STALENESS_NORMALIZATION_SECONDS * 100.0).min(100.0);
        WEIGHT_HEALTH * health.health_score as f64
            + WEIGHT_STALENESS * staleness
            + WEIGHT_SUCCESS_RATE * health.success_rate()
    }

    /// Applies the outcome of one fetch attempt and persists the
    /// snapshot. Health stays within [0, 100]; cooldown only moves
    /// forward on failure and is cleared on success.
    pub fn report_outcome(&mut self, endpoint: &str, success: bool) {
        self.report_outcome_at(endpoint, success, unix_now());
    }

    pub(crate) fn report_outcome_at(&mut self, endpoint: &str, success: bool, now: f64) {
        let health = self
            .status
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointHealth::new(now));

        if success {
            health.success_count += 1;
            health.last_success = Some(now);
            health.health_score = (health.health_score + SUCCESS_REWARD).min(100);
            health.fail_count = 0;
            health.cooldown_until = 0.0;
            info!(
                endpoint = %endpoint,
                health = health.health_score,
                "endpoint success recorded"
            );
        } else {
            health.fail_count += 1;
            health.last_failure = Some(now);

            // last_success still holds the value from before this
            // failure, which is exactly what the 24 h window wants.
            let had_recent_success = health
                .last_success
                .is_some_and(|ts| now - ts < RECENT_SUCCESS_WINDOW_SECONDS);

            let cooldown = if had_recent_success {
                health.health_score = (health.health_score - 10).max(50);
                (10.0 * health.fail_count as f64).min(60.0)
            } else {
                health.health_score = (health.health_score - 20).max(20);
                (60.0 * 2f64.powi(health.fail_count as i32 - 1)).min(3600.0)
            };
            health.cooldown_until = now + cooldown;
            warn!(
                endpoint = %endpoint,
                consecutive_failures = health.fail_count,
                health = health.health_score,
                cooldown_s = cooldown as u64,
                "endpoint failure recorded"
            );
        }
        health.last_update = now;

        if let Err(err) = self.save_snapshot() {
            warn!(error = %err, "failed to persist health snapshot");
        }
    }

    /// Re-seeds the candidate set from the static list plus the remote
    /// roster document. Never removes endpoints; an unreachable or
    /// malformed roster keeps the current set.
    pub async fn refresh(&mut self, client: &reqwest::Client) {
        let now = unix_now();
        self.merge_endpoints(self.seed_endpoints.clone(), now);
        match roster::fetch_roster(client, &self.roster_url).await {
            Ok(endpoints) => {
                let before = self.status.len();
                self.merge_endpoints(endpoints, now);
                info!(
                    known = before,
                    added = self.status.len() - before,
                    total = self.status.len(),
                    "endpoint roster refreshed"
                );
            }
            Err(err) => {
                warn!(error = %err, "roster refresh failed, keeping current endpoint set");
            }
        }
    }

    fn merge_endpoints(&mut self, endpoints: Vec<String>, now: f64) {
        for endpoint in endpoints {
            let endpoint = normalize_endpoint(&endpoint);
            self.status
                .entry(endpoint)
                .or_insert_with(|| EndpointHealth::new(now));
        }
    }

    /// Drops endpoints whose newest recorded timestamp (updates,
    /// outcomes, or selection) is older than the retention window.
    pub fn expire(&mut self) {
        self.expire_at(unix_now());
    }

    pub(crate) fn expire_at(&mut self, now: f64) {
        let cutoff = now - self.retention_days as f64 * 24.0 * 3600.0;
        let last_used = &self.last_used;
        self.status.retain(|url, health| {
            let newest = [
                Some(health.last_update),
                health.last_success,
                health.last_failure,
                last_used.get(url).copied(),
            ]
            .into_iter()
            .flatten()
            .fold(0.0f64, f64::max);
            let keep = newest >= cutoff;
            if !keep {
                info!(endpoint = %url, "expiring unused endpoint");
            }
            keep
        });
        let status = &self.status;
        self.last_used.retain(|url, _| status.contains_key(url));
    }

    pub fn save_snapshot(&self) -> RegistryResult<()> {
        snapshot::save(&self.snapshot_path, &self.status)
    }
}

fn normalize_endpoint(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_section(dir: &std::path::Path) -> (RegistrySection, PathBuf) {
        let section = RegistrySection {
            seed_endpoints: vec![
                "https://mirror-a.example".into(),
                "https://mirror-b.example".into(),
            ],
            roster_url: "https://roster.example/list.md".into(),
            refresh_interval_seconds: 86_400,
            reuse_interval_seconds: 20,
            retention_days: 7,
            snapshot_file: "endpoint_health.json".into(),
        };
        let path = dir.join("endpoint_health.json");
        (section, path)
    }

    fn registry() -> (EndpointHealthRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (section, path) = test_section(dir.path());
        (EndpointHealthRegistry::open(&section, path), dir)
    }

    #[test]
    fn health_score_stays_in_bounds() {
        let (mut registry, _dir) = registry();
        let mut now = 1_000_000.0;
        for round in 0..30 {
            registry.report_outcome_at("https://mirror-a.example", round % 3 == 0, now);
            let health = registry.health("https://mirror-a.example").unwrap();
            assert!((0..=100).contains(&health.health_score));
            now += 1.0;
        }
    }

    #[test]
    fn success_rewards_and_clears_cooldown() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000.0;
        registry.report_outcome_at("https://mirror-a.example", false, now);
        registry.report_outcome_at("https://mirror-a.example", true, now + 100.0);
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.health_score, 85); // 100 - 20 + 5
        assert_eq!(health.fail_count, 0);
        assert_eq!(health.cooldown_until, 0.0);
        assert_eq!(health.last_success, Some(now + 100.0));
    }

    #[test]
    fn success_reward_caps_at_100() {
        let (mut registry, _dir) = registry();
        for i in 0..5 {
            registry.report_outcome_at("https://mirror-a.example", true, 1_000_000.0 + i as f64);
        }
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.health_score, 100);
    }

    #[test]
    fn cold_failures_back_off_exponentially() {
        let (mut registry, _dir) = registry();
        let mut now = 1_000_000.0;
        let expected_cooldowns = [60.0, 120.0, 240.0, 480.0, 960.0, 1920.0, 3600.0, 3600.0];
        for expected in expected_cooldowns {
            registry.report_outcome_at("https://mirror-a.example", false, now);
            let health = registry.health("https://mirror-a.example").unwrap();
            assert_eq!(health.cooldown_until, now + expected);
            now = health.cooldown_until + 1.0;
        }
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.health_score, 20); // floor for cold endpoints
    }

    #[test]
    fn warm_failures_get_gentler_penalties() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000.0;
        registry.report_outcome_at("https://mirror-a.example", true, now);
        registry.report_outcome_at("https://mirror-a.example", false, now + 60.0);
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.health_score, 90); // 100 (capped) - 10
        assert_eq!(health.cooldown_until, now + 60.0 + 10.0);

        registry.report_outcome_at("https://mirror-a.example", false, now + 120.0);
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.cooldown_until, now + 120.0 + 20.0);

        // The gentler floor is 50.
        let mut later = now + 200.0;
        for _ in 0..10 {
            registry.report_outcome_at("https://mirror-a.example", false, later);
            later += 1.0;
        }
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.health_score, 50);
    }

    #[test]
    fn select_skips_cooldown_reuse_and_dead_endpoints() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000.0;

        // mirror-a cooling down after a failure.
        registry.report_outcome_at("https://mirror-a.example", false, now);
        // mirror-b just used.
        registry.last_used.insert("https://mirror-b.example".into(), now - 5.0);

        assert_eq!(registry.select_at(now), None);

        // After the reuse interval, mirror-b becomes eligible again.
        let selected = registry.select_at(now + 21.0);
        assert_eq!(selected.as_deref(), Some("https://mirror-b.example"));
    }

    #[test]
    fn select_prefers_healthier_endpoint() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000.0;
        registry.report_outcome_at("https://mirror-a.example", false, now - 7200.0);
        let selected = registry.select_at(now);
        assert_eq!(selected.as_deref(), Some("https://mirror-b.example"));
    }

    #[test]
    fn select_records_last_used() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000.0;
        let selected = registry.select_at(now).unwrap();
        assert_eq!(registry.last_used.get(&selected).copied(), Some(now));
        // Immediate reselection of the same endpoint is impossible; the
        // other seed wins the next round.
        let second = registry.select_at(now + 1.0).unwrap();
        assert_ne!(second, selected);
    }

    #[test]
    fn fresh_endpoint_failure_scenario() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000.0;
        registry.report_outcome_at("https://mirror-a.example", false, now);
        let health = registry.health("https://mirror-a.example").unwrap();
        assert_eq!(health.health_score, 80);
        assert_eq!(health.cooldown_until, now + 60.0);

        // Excluded immediately, mirror-b gets picked instead.
        assert_eq!(
            registry.select_at(now).as_deref(),
            Some("https://mirror-b.example")
        );

        // After 61 simulated seconds mirror-a is selectable again and
        // outranks the just-used mirror-b.
        let selected = registry.select_at(now + 61.0);
        assert_eq!(selected.as_deref(), Some("https://mirror-a.example"));
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (section, path) = test_section(dir.path());
        let mut registry = EndpointHealthRegistry::open(&section, path.clone());
        let now = 1_000_000.0;
        registry.report_outcome_at("https://mirror-a.example", true, now);
        registry.report_outcome_at("https://mirror-a.example", false, now + 10.0);
        registry.report_outcome_at("https://mirror-b.example", false, now + 20.0);

        let reloaded = EndpointHealthRegistry::open(&section, path);
        assert_eq!(registry.status, reloaded.status);
    }

    #[test]
    fn missing_snapshot_starts_with_seeds_only() {
        let (registry, _dir) = registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.health("https://mirror-a.example").unwrap().health_score,
            100
        );
    }

    #[test]
    fn expire_drops_stale_entries_only() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000_000.0;
        let eight_days = 8.0 * 24.0 * 3600.0;
        registry.report_outcome_at("https://mirror-a.example", true, now - eight_days);
        registry.report_outcome_at("https://mirror-b.example", true, now - 3600.0);
        // Force mirror-a's creation timestamp out of the window too.
        registry
            .status
            .get_mut("https://mirror-a.example")
            .unwrap()
            .last_update = now - eight_days;

        registry.expire_at(now);
        assert!(registry.health("https://mirror-a.example").is_none());
        assert!(registry.health("https://mirror-b.example").is_some());
    }

    #[test]
    fn expire_counts_selection_as_use() {
        let (mut registry, _dir) = registry();
        let now = 1_000_000_000.0;
        let eight_days = 8.0 * 24.0 * 3600.0;
        for health in registry.status.values_mut() {
            health.last_update = now - eight_days;
        }
        registry.last_used.insert("https://mirror-a.example".into(), now - 60.0);

        registry.expire_at(now);
        assert!(registry.health("https://mirror-a.example").is_some());
        assert!(registry.health("https://mirror-b.example").is_none());
    }

    #[test]
    fn normalizes_trailing_slashes() {
        let (mut registry, _dir) = registry();
        registry.merge_endpoints(vec!["https://mirror-a.example/".into()], 1.0);
        assert_eq!(registry.len(), 2);
    }
}
