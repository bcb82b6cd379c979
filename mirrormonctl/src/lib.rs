use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use mirrormon_core::{
    load_monitor_config, BrowserError, BrowserSessionManager, EndpointHealthRegistry,
    FetchOrchestrator, HttpSessionCleanup, Monitor, MonitorConfig, Record, TimelineParser,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] mirrormon_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("authentication failed")]
    Authentication,
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Mirror monitor command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main mirrormon.toml
    #[arg(long, default_value = "configs/mirrormon.toml")]
    pub config: PathBuf,
    /// Data directory override (replaces monitor.data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Alternative path for the health snapshot file
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
    /// Token for local authentication (when MIRRORMONCTL_TOKEN is set)
    #[arg(long)]
    pub token: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show a summary of configuration and endpoint health
    Status,
    /// Endpoint health operations
    #[command(subcommand)]
    Endpoints(EndpointCommands),
    /// Fetch one account once and print the records
    Fetch(FetchArgs),
    /// Run the monitoring loop until interrupted
    Run,
    /// Run basic integrity checks
    #[command(name = "health")]
    #[command(subcommand)]
    Health(HealthCommands),
    /// Generate shell completions
    Completions(CompletionArgs),
}

#[derive(Subcommand, Debug)]
pub enum EndpointCommands {
    /// List known endpoints ordered by health
    List(EndpointListArgs),
}

#[derive(Args, Debug)]
pub struct EndpointListArgs {
    /// Limit the number of rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Account handle to fetch
    pub handle: String,
}

#[derive(Subcommand, Debug)]
pub enum HealthCommands {
    /// Run the checks once
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    enforce_token(&cli)?;

    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "mirrormonctl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status();
            render(&status, cli.format)?;
        }
        Commands::Endpoints(EndpointCommands::List(args)) => {
            let list = context.endpoint_list(args.limit);
            render(&list, cli.format)?;
        }
        Commands::Fetch(args) => {
            let records = runtime.block_on(context.fetch_once(&args.handle))?;
            render(&records, cli.format)?;
        }
        Commands::Run => {
            runtime.block_on(context.run_monitor())?;
        }
        Commands::Health(HealthCommands::Check) => {
            let report = runtime.block_on(context.health_check());
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => unreachable!("handled above"),
    }

    Ok(())
}

fn enforce_token(cli: &Cli) -> Result<()> {
    if let Ok(expected) = std::env::var("MIRRORMONCTL_TOKEN") {
        match &cli.token {
            Some(provided) if provided == &expected => Ok(()),
            _ => Err(AppError::Authentication),
        }
    } else {
        Ok(())
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: MonitorConfig,
    config_path: PathBuf,
    snapshot_path: PathBuf,
    screenshots_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_monitor_config(&config_path)?;
        if let Some(data_dir) = &cli.data_dir {
            config.monitor.data_dir = data_dir.display().to_string();
        }
        let snapshot_path = cli.snapshot.clone().unwrap_or_else(|| config.snapshot_path());
        let screenshots_dir = config.screenshots_dir();

        Ok(Self {
            config,
            config_path,
            snapshot_path,
            screenshots_dir,
        })
    }

    fn open_registry(&self) -> EndpointHealthRegistry {
        EndpointHealthRegistry::open(&self.config.registry, self.snapshot_path.clone())
    }

    fn build_session(&self) -> BrowserSessionManager {
        BrowserSessionManager::new(
            self.config.chrome.clone(),
            &self.config.fetch,
            self.screenshots_dir.clone(),
        )
        .with_cleanup(Arc::new(HttpSessionCleanup::default()))
    }

    fn build_orchestrator(&self) -> FetchOrchestrator<BrowserSessionManager> {
        FetchOrchestrator::new(
            self.open_registry(),
            self.build_session(),
            Arc::new(TimelineParser::new()),
            self.screenshots_dir.clone(),
            self.config.fetch.max_attempts,
        )
    }

    fn gather_status(&self) -> StatusReport {
        let registry = self.open_registry();
        let now = unix_now();
        let cooling = registry
            .top_endpoints(usize::MAX)
            .iter()
            .filter(|(url, _)| {
                registry
                    .health(url)
                    .is_some_and(|health| health.cooldown_until > now)
            })
            .count();
        StatusReport {
            accounts: self
                .config
                .monitor
                .accounts
                .iter()
                .map(|account| account.handle.clone())
                .collect(),
            check_interval_seconds: self.config.monitor.check_interval_seconds,
            chrome: format!("{}:{}", self.config.chrome.host, self.config.chrome.port),
            endpoints: registry.len(),
            endpoints_cooling: cooling,
            top: self.endpoint_list(5).rows,
        }
    }

    fn endpoint_list(&self, limit: usize) -> EndpointList {
        let registry = self.open_registry();
        let now = unix_now();
        let rows = registry
            .top_endpoints(limit)
            .into_iter()
            .filter_map(|(url, score)| {
                let health = registry.health(&url)?;
                let cooldown_remaining_s = if health.cooldown_until > now {
                    Some((health.cooldown_until - now) as u64)
                } else {
                    None
                };
                let last_success = health.last_success.and_then(format_timestamp);
                Some(EndpointRow {
                    url,
                    health: score,
                    successes: health.success_count,
                    failures: health.fail_count,
                    cooldown_remaining_s,
                    last_success,
                })
            })
            .collect();
        EndpointList { rows }
    }

    async fn fetch_once(&self, handle: &str) -> Result<FetchReport> {
        let mut orchestrator = self.build_orchestrator();
        let records = orchestrator.fetch_records(handle).await;
        orchestrator.session_mut().close().await;
        Ok(FetchReport {
            handle: handle.to_string(),
            records,
        })
    }

    async fn run_monitor(&self) -> Result<()> {
        let orchestrator = self.build_orchestrator();
        let mut monitor = Monitor::new(
            orchestrator,
            self.config.monitor.clone(),
            &self.config.registry,
        );

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });

        monitor.run(shutdown_rx).await;
        monitor.shutdown().await;
        Ok(())
    }

    async fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(check_path("mirrormon.toml", &self.config_path));
        results.push(check_directory(
            "data_dir",
            Path::new(&self.config.monitor.data_dir),
        ));

        if self.snapshot_path.exists() {
            results.push(HealthEntry::ok(
                "health snapshot",
                format!("{}", self.snapshot_path.display()),
            ));
        } else {
            results.push(HealthEntry::warn(
                "health snapshot",
                format!("{} not created yet", self.snapshot_path.display()),
            ));
        }

        if self.config.monitor.accounts.is_empty() {
            results.push(HealthEntry::error("accounts", "no accounts configured"));
        } else {
            results.push(HealthEntry::ok(
                "accounts",
                format!("{} configured", self.config.monitor.accounts.len()),
            ));
        }

        results.push(self.check_chrome().await);
        results
    }

    async fn check_chrome(&self) -> HealthEntry {
        let url = format!(
            "http://{}:{}/json/version",
            self.config.chrome.host, self.config.chrome.port
        );
        let client = reqwest::Client::new();
        match client
            .get(&url)
            .timeout(std::time::Duration::from_secs(
                self.config.chrome.discovery_timeout_seconds,
            ))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                HealthEntry::ok("chrome", format!("{url} reachable"))
            }
            Ok(response) => {
                HealthEntry::warn("chrome", format!("{url} returned HTTP {}", response.status()))
            }
            Err(err) => HealthEntry::warn("chrome", format!("{url}: {err}")),
        }
    }
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{} missing", path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn format_timestamp(epoch: f64) -> Option<String> {
    chrono::DateTime::from_timestamp(epoch as i64, 0)
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub accounts: Vec<String>,
    pub check_interval_seconds: u64,
    pub chrome: String,
    pub endpoints: usize,
    pub endpoints_cooling: usize,
    pub top: Vec<EndpointRow>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Accounts: {}", self.accounts.join(", ")),
            format!("Check interval: {}s", self.check_interval_seconds),
            format!("Chrome: {}", self.chrome),
            format!(
                "Endpoints: {} known, {} cooling down",
                self.endpoints, self.endpoints_cooling
            ),
        ];
        if !self.top.is_empty() {
            lines.push("Top endpoints:".to_string());
            for row in &self.top {
                lines.push(format!("  {}", row.display()));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct EndpointList {
    pub rows: Vec<EndpointRow>,
}

#[derive(Debug, Serialize)]
pub struct EndpointRow {
    pub url: String,
    pub health: i64,
    pub successes: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<String>,
}

impl DisplayFallback for EndpointRow {
    fn display(&self) -> String {
        let cooling = self
            .cooldown_remaining_s
            .map(|s| format!(" cooling={s}s"))
            .unwrap_or_default();
        let last = self
            .last_success
            .as_deref()
            .map(|ts| format!(" last_success={ts}"))
            .unwrap_or_default();
        format!(
            "{} health={} ok={} fail={}{}{}",
            self.url, self.health, self.successes, self.failures, cooling, last
        )
    }
}

impl DisplayFallback for EndpointList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No endpoints known".to_string();
        }
        self.rows
            .iter()
            .map(|row| row.display())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub handle: String,
    pub records: Vec<Record>,
}

impl DisplayFallback for FetchReport {
    fn display(&self) -> String {
        if self.records.is_empty() {
            return format!("No records fetched for @{}", self.handle);
        }
        let mut lines = vec![format!(
            "{} records for @{}:",
            self.records.len(),
            self.handle
        )];
        for record in &self.records {
            let when = record.timestamp.as_deref().unwrap_or("-");
            lines.push(format!("  {} [{}] {}", record.id, when, record.text));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let configs_dir = root.join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/mirrormon.toml", configs_dir.join("mirrormon.toml")).unwrap();

        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();

        let cli = Cli {
            config: configs_dir.join("mirrormon.toml"),
            data_dir: Some(data_dir),
            snapshot: None,
            token: None,
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[test]
    fn status_report_counts_seed_endpoints() {
        let (_temp, context) = prepare_test_context().unwrap();
        let status = context.gather_status();
        assert!(status.endpoints >= 3);
        assert_eq!(status.endpoints_cooling, 0);
        assert!(!status.accounts.is_empty());
    }

    #[test]
    fn endpoint_listing_orders_by_health() {
        let (_temp, context) = prepare_test_context().unwrap();
        let list = context.endpoint_list(50);
        assert!(!list.rows.is_empty());
        for pair in list.rows.windows(2) {
            assert!(pair[0].health >= pair[1].health);
        }
    }

    #[test]
    fn endpoint_listing_respects_limit() {
        let (_temp, context) = prepare_test_context().unwrap();
        let list = context.endpoint_list(2);
        assert_eq!(list.rows.len(), 2);
    }

    #[tokio::test]
    async fn health_check_flags_missing_snapshot() {
        let (_temp, context) = prepare_test_context().unwrap();
        let report = context.health_check().await;
        let snapshot = report
            .iter()
            .find(|entry| entry.name == "health snapshot")
            .unwrap();
        assert!(matches!(snapshot.status, CheckStatus::Warn));
        let config = report
            .iter()
            .find(|entry| entry.name == "mirrormon.toml")
            .unwrap();
        assert!(matches!(config.status, CheckStatus::Ok));
    }

    #[test]
    fn token_gate_rejects_wrong_token() {
        let cli = Cli {
            config: PathBuf::from("configs/mirrormon.toml"),
            data_dir: None,
            snapshot: None,
            token: Some("nope".into()),
            format: OutputFormat::Text,
            command: Commands::Status,
        };
        std::env::set_var("MIRRORMONCTL_TOKEN", "secret");
        let result = enforce_token(&cli);
        std::env::remove_var("MIRRORMONCTL_TOKEN");
        assert!(matches!(result, Err(AppError::Authentication)));
    }
}
