//! Janitor-specific error types.

use image_service_client::ImageServiceError;
use pxe_boot::BootError;
use thiserror::Error;

/// Errors that stop the janitor
#[derive(Debug, Error)]
pub enum JanitorError {
    /// Boot engine error (settings, filesystem, templates)
    #[error("Boot engine error: {0}")]
    Boot(#[from] BootError),

    /// Image service client could not be built
    #[error("Image service error: {0}")]
    ImageService(#[from] ImageServiceError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sweep loop failed outside a single sweep
    #[error("Janitor failed: {0}")]
    Run(#[from] anyhow::Error),
}
