pub mod browser;
pub mod config;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod parser;
pub mod registry;

pub use browser::{
    BrowserError, BrowserResult, BrowserSessionManager, HttpSessionCleanup, InterceptionPolicy,
    RequestDecision, SessionCleanup, StealthProfile,
};
pub use config::{load_monitor_config, AccountEntry, MonitorConfig};
pub use error::{ConfigError, Result};
pub use monitor::{Monitor, Notifier};
pub use orchestrator::{ContentParser, FetchOrchestrator, MarkupFetcher, Record};
pub use parser::TimelineParser;
pub use registry::{parse_roster, EndpointHealth, EndpointHealthRegistry, RegistryError};
