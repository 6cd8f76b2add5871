//! Image service client errors

use thiserror::Error;

/// Errors that can occur when interacting with the image service
#[derive(Debug, Error)]
pub enum ImageServiceError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Image service returned an error
    #[error("Image service API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (invalid token, expired, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Image not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The image reference is neither a UUID nor a supported URL
    #[error("Invalid image reference: {0}")]
    InvalidHref(String),

    /// Writing the downloaded image failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
