use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{AccountEntry, MonitorSection, RegistrySection};
use crate::orchestrator::{FetchOrchestrator, MarkupFetcher, Record};
use crate::registry::unix_now;

/// External collaborator delivering fetched records to a push channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, account: &AccountEntry, records: &[Record]);
}

/// The periodic monitoring loop. Owns the orchestrator (and through it
/// the registry and the one browser session); the shutdown path closes
/// that session directly rather than discovering it through ambient
/// global state.
pub struct Monitor<F: MarkupFetcher> {
    orchestrator: FetchOrchestrator<F>,
    monitor: MonitorSection,
    refresh_interval: f64,
    http: reqwest::Client,
    notifier: Option<Arc<dyn Notifier>>,
    last_expire: f64,
    last_refresh: f64,
}

impl<F: MarkupFetcher> Monitor<F> {
    pub fn new(
        orchestrator: FetchOrchestrator<F>,
        monitor: MonitorSection,
        registry: &RegistrySection,
    ) -> Self {
        Self {
            orchestrator,
            monitor,
            refresh_interval: registry.refresh_interval_seconds as f64,
            http: reqwest::Client::new(),
            notifier: None,
            last_expire: 0.0,
            last_refresh: unix_now(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn orchestrator_mut(&mut self) -> &mut FetchOrchestrator<F> {
        &mut self.orchestrator
    }

    /// Runs monitoring cycles until the shutdown signal flips, then
    /// closes the session best effort and returns.
    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            accounts = self.monitor.accounts.len(),
            interval_s = self.monitor.check_interval_seconds,
            "monitor started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.cycle().await {
                Ok(()) => Duration::from_secs(self.monitor.check_interval_seconds),
                Err(err) => {
                    error!(error = %err, "monitoring cycle failed");
                    Duration::from_secs(self.monitor.error_pause_seconds)
                }
            };
            info!(pause_s = pause.as_secs(), "cycle complete, waiting");
            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("monitor stopping");
    }

    async fn cycle(&mut self) -> crate::browser::BrowserResult<()> {
        let now = unix_now();

        if now - self.last_expire >= self.monitor.expire_interval_seconds as f64 {
            self.orchestrator.registry_mut().expire();
            self.last_expire = now;
        }
        if now - self.last_refresh >= self.refresh_interval {
            let client = self.http.clone();
            self.orchestrator.registry_mut().refresh(&client).await;
            self.last_refresh = now;
        }

        let accounts = self.monitor.accounts.clone();
        for account in &accounts {
            let records = self.orchestrator.fetch_records(&account.handle).await;
            if records.is_empty() {
                warn!(account = %account.handle, "no records fetched this cycle");
                continue;
            }
            info!(
                account = %account.handle,
                records = records.len(),
                "records fetched"
            );
            if let Some(notifier) = &self.notifier {
                notifier.notify(account, &records).await;
            }
        }
        Ok(())
    }
}

impl Monitor<crate::browser::BrowserSessionManager> {
    /// Best-effort shutdown of the owned session; failures are
    /// swallowed since the process is terminating regardless.
    pub async fn shutdown(&mut self) {
        self.orchestrator.session_mut().close().await;
        if let Err(err) = self.orchestrator.registry().save_snapshot() {
            warn!(error = %err, "failed to persist health snapshot during shutdown");
        }
        info!("monitor shutdown complete");
    }
}
