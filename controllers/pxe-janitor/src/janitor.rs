//! Periodic image cache maintenance.
//!
//! Sweeps the master image cache on a fixed interval. A failed sweep is
//! retried with Fibonacci backoff instead of waiting a full interval.

use crate::backoff::FibonacciBackoff;
use anyhow::Context;
use pxe_boot::{BootConfigRenderer, CleanupReport, ImageCache, Settings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const MIN_RETRY_SECS: u64 = 5;

/// Image cache janitor
pub struct Janitor {
    cache: Arc<ImageCache>,
    renderer: BootConfigRenderer,
    write_boot_script: bool,
    interval: Duration,
    backoff: FibonacciBackoff,
}

impl Janitor {
    pub fn new(settings: &Settings, cache: Arc<ImageCache>) -> Self {
        let interval_secs = settings.cache.sweep_interval_secs.max(1);
        Self {
            cache,
            renderer: BootConfigRenderer::from_settings(settings),
            write_boot_script: settings.deploy.http_url.is_some(),
            interval: Duration::from_secs(interval_secs),
            backoff: FibonacciBackoff::new(MIN_RETRY_SECS, interval_secs),
        }
    }

    /// One-time work before the first sweep
    pub fn startup(&self) -> anyhow::Result<()> {
        if self.write_boot_script {
            let written = self
                .renderer
                .ensure_ipxe_boot_script()
                .context("failed to write iPXE boot script")?;
            if !written {
                debug!(
                    "iPXE boot script {} is up to date",
                    self.renderer.boot_script_path().display()
                );
            }
        }
        Ok(())
    }

    /// Runs one cache sweep off the async runtime
    pub async fn sweep_once(&self) -> anyhow::Result<CleanupReport> {
        let cache = Arc::clone(&self.cache);
        let report = tokio::task::spawn_blocking(move || cache.clean_up(None))
            .await
            .context("cache sweep task panicked")?
            .context("failed to sweep image cache")?;
        Ok(report)
    }

    /// Sweeps and returns how long to wait before the next sweep
    pub async fn tick(&mut self) -> Duration {
        match self.sweep_once().await {
            Ok(report) => {
                self.backoff.reset();
                if report.evicted.is_empty() {
                    debug!(
                        "Image cache sweep done: {} bytes cached, nothing evicted",
                        report.remaining_bytes
                    );
                } else {
                    info!(
                        "Image cache sweep evicted {} masters ({} bytes), {} bytes remain",
                        report.evicted.len(),
                        report.reclaimed_bytes,
                        report.remaining_bytes
                    );
                }
                self.interval
            }
            Err(e) => {
                let delay = self.backoff.next_backoff();
                error!("{:#}; retrying in {}s", e, delay.as_secs());
                delay
            }
        }
    }

    /// Sweeps until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        self.startup()?;
        tokio::pin!(shutdown);
        loop {
            let delay = self.tick().await;
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down image cache janitor");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
