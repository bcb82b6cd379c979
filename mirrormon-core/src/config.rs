use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    pub monitor: MonitorSection,
    pub registry: RegistrySection,
    pub chrome: ChromeSection,
    pub fetch: FetchSection,
}

impl MonitorConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.monitor.data_dir).join(path)
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.resolve_path(&self.registry.snapshot_file)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.resolve_path(&self.fetch.screenshots_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    pub data_dir: String,
    pub check_interval_seconds: u64,
    pub expire_interval_seconds: u64,
    pub error_pause_seconds: u64,
    pub accounts: Vec<AccountEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountEntry {
    pub name: String,
    pub handle: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    pub seed_endpoints: Vec<String>,
    pub roster_url: String,
    pub refresh_interval_seconds: u64,
    pub reuse_interval_seconds: u64,
    pub retention_days: u32,
    pub snapshot_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromeSection {
    pub host: String,
    pub port: u16,
    pub connect_attempts: usize,
    pub connect_retry_delay_ms: u64,
    pub health_check_interval_seconds: u64,
    pub discovery_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    pub max_attempts: usize,
    pub navigation_timeout_seconds: u64,
    pub content_selector: String,
    pub content_timeout_seconds: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: String,
    pub accept_language: String,
    pub probe_script: String,
    pub screenshots_dir: String,
}

pub fn load_monitor_config<P: AsRef<Path>>(path: P) -> Result<MonitorConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
