//! ImageServiceTrait for mocking
//!
//! This trait abstracts the image service client so the boot engine can be
//! unit tested without a running image store.

use crate::error::ImageServiceError;
use crate::models::ImageMetadata;
use std::path::Path;

/// Trait for image service operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ImageServiceTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Look up image metadata by reference
    async fn show(&self, image_href: &str) -> Result<ImageMetadata, ImageServiceError>;

    /// Download the image content to `dest`, returning the number of bytes written
    async fn download(&self, image_href: &str, dest: &Path) -> Result<u64, ImageServiceError>;
}
