//! Boot engine errors

use image_service_client::ImageServiceError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("Address resolution error: {0}")]
    AddressResolution(String),

    #[error("Failed to get IP addresses for node {node}: {reason}")]
    AddressLookupFailed { node: String, reason: String },

    #[error("Missing boot artifacts: {0}")]
    ArtifactMissing(String),

    #[error("Image download failed for {href}: {reason}")]
    ImageDownloadFailed { href: String, reason: String },

    #[error("Image cache entry {0} is held by an in-flight fetch")]
    ImageCacheEvictionConflict(String),

    #[error("DHCP update failed: {0}")]
    DhcpUpdateFailed(String),

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Node store error: {0}")]
    NodeStore(String),

    #[error("Image conversion failed: {0}")]
    Conversion(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Image service error: {0}")]
    ImageService(#[from] ImageServiceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BootError {
    /// Wraps an I/O error with the path it happened on
    pub(crate) fn fs(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> BootError {
        let path = path.into();
        move |source| BootError::Filesystem { path, source }
    }
}

impl From<minijinja::Error> for BootError {
    fn from(err: minijinja::Error) -> Self {
        BootError::Template(err.to_string())
    }
}

impl From<regex::Error> for BootError {
    fn from(err: regex::Error) -> Self {
        BootError::Template(format!("invalid pattern: {}", err))
    }
}

pub type Result<T, E = BootError> = std::result::Result<T, E>;

/// Runs `fut`, failing with [`BootError::Timeout`] once `limit` elapses
pub(crate) async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BootError::Timeout {
            operation: operation.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}
