//! Mock image service for unit testing
//!
//! Stores image metadata and content in memory and counts downloads per
//! reference so tests can assert cache behaviour.

use crate::error::ImageServiceError;
use crate::image_trait::ImageServiceTrait;
use crate::models::{parse_image_id, ImageMetadata};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock image service for testing
#[derive(Debug, Clone)]
pub struct MockImageService {
    pub(crate) base_url: String,
    pub(crate) images: Arc<Mutex<HashMap<String, ImageMetadata>>>,
    pub(crate) contents: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub(crate) downloads: Arc<Mutex<HashMap<String, usize>>>,
    pub(crate) failing: Arc<Mutex<HashSet<String>>>,
    pub(crate) download_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockImageService {
    /// Create a new mock service
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            images: Arc::new(Mutex::new(HashMap::new())),
            contents: Arc::new(Mutex::new(HashMap::new())),
            downloads: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            download_delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Normalizes `glance://<uuid>` and bare UUIDs to the same key
    fn key(href: &str) -> String {
        parse_image_id(href).unwrap_or_else(|| href.to_string())
    }

    /// Add image metadata (for test setup)
    pub fn add_image(&self, image: ImageMetadata) {
        self.images.lock().unwrap().insert(Self::key(&image.id), image);
    }

    /// Set the bytes returned when `href` is downloaded (for test setup)
    pub fn add_content(&self, href: &str, content: impl Into<Vec<u8>>) {
        self.contents.lock().unwrap().insert(Self::key(href), content.into());
    }

    /// Make every download of `href` fail
    pub fn fail_downloads(&self, href: &str) {
        self.failing.lock().unwrap().insert(Self::key(href));
    }

    /// Delay every download, to widen race windows in concurrency tests
    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = Some(delay);
    }

    /// Number of completed or attempted downloads of `href`
    pub fn download_count(&self, href: &str) -> usize {
        self.downloads.lock().unwrap().get(&Self::key(href)).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ImageServiceTrait for MockImageService {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn show(&self, image_href: &str) -> Result<ImageMetadata, ImageServiceError> {
        self.images
            .lock()
            .unwrap()
            .get(&Self::key(image_href))
            .cloned()
            .ok_or_else(|| ImageServiceError::NotFound(format!("image {} not found", image_href)))
    }

    async fn download(&self, image_href: &str, dest: &Path) -> Result<u64, ImageServiceError> {
        let key = Self::key(image_href);
        *self.downloads.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        let delay = *self.download_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(&key) {
            return Err(ImageServiceError::Api(format!("download of {} failed", image_href)));
        }
        let content = self
            .contents
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| ImageServiceError::NotFound(format!("no content for {}", image_href)))?;

        tokio::fs::write(dest, &content).await?;
        Ok(content.len() as u64)
    }
}
