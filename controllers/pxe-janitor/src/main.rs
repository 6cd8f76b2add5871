//! PXE Janitor
//!
//! Background companion of the PXE boot engine:
//! - writes the iPXE boot script into the HTTP root
//! - sweeps the master image cache, evicting expired and excess masters
//!   that no node links to
//!
//! Settings come from the YAML file named by `PXE_CONFIG_FILE` (optional),
//! overridden by `PXE_*` environment variables.

mod backoff;
mod error;
mod janitor;

use crate::error::JanitorError;
use image_service_client::ImageServiceClient;
use janitor::Janitor;
use pxe_boot::{ImageCache, QemuImgConverter, Settings};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), JanitorError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting PXE image cache janitor");

    let config_file = env::var("PXE_CONFIG_FILE").ok().map(PathBuf::from);
    let settings = Settings::load(config_file.as_deref())?;
    let Some(master_path) = settings.cache.master_path.clone() else {
        return Err(JanitorError::InvalidConfig(
            "cache.master_path is not set; there is no image cache to sweep".to_string(),
        ));
    };

    info!("Configuration:");
    info!(
        "  Config file: {}",
        config_file
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none (environment only)".to_string())
    );
    info!("  TFTP root: {}", settings.pxe.tftp_root.display());
    info!("  HTTP root: {}", settings.deploy.http_root.display());
    info!("  Master image path: {}", master_path.display());
    info!(
        "  Cache bounds: {} MiB, TTL {} minutes",
        settings.cache.size_mib, settings.cache.ttl_minutes
    );
    info!("  Sweep interval: {}s", settings.cache.sweep_interval_secs);

    let images = ImageServiceClient::with_timeout(
        settings.image_service.url.clone(),
        settings.image_service.token.clone(),
        settings.image_service.timeout(),
    )?;
    let cache = Arc::new(ImageCache::new(
        &settings,
        Arc::new(images),
        Arc::new(QemuImgConverter::default()),
    ));

    Janitor::new(&settings, cache)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
