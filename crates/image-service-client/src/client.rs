//! Image service API client
//!
//! Implements metadata lookup against the v2 images API
//! (`/v2/images/{id}`) and streamed downloads of either service-hosted
//! images (`/v2/images/{id}/file`) or plain HTTP(S) locations.

use crate::error::ImageServiceError;
use crate::image_trait::ImageServiceTrait;
use crate::models::{ImageHref, ImageMetadata};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Image service API client
#[derive(Debug, Clone)]
pub struct ImageServiceClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl ImageServiceClient {
    /// Create a new image service client with the default 30 second timeout
    ///
    /// # Arguments
    /// * `base_url` - Image service base URL (e.g., "http://glance:9292")
    /// * `token` - Optional API token sent as `X-Auth-Token`
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, ImageServiceError> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    /// Create a new client with an explicit request timeout.
    ///
    /// Metadata requests are bounded by `timeout` as a whole. Downloads are
    /// only bounded per read: a body that keeps arriving may take as long as
    /// it needs, a stalled one fails after `timeout`. Callers bound the total
    /// download time themselves.
    pub fn with_timeout(
        base_url: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ImageServiceError> {
        let client = Client::builder()
            .connect_timeout(timeout.min(CONNECT_TIMEOUT))
            .read_timeout(timeout)
            .build()
            .map_err(ImageServiceError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            request_timeout: timeout,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("X-Auth-Token", token),
            None => request,
        }
    }

    fn image_url(&self, id: &uuid::Uuid) -> String {
        format!("{}/v2/images/{}", self.base_url, id)
    }

    async fn check_status(response: Response, what: &str) -> Result<Response, ImageServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ImageServiceError::Authentication(
                format!("{}: {} - {}", what, status, body),
            )),
            StatusCode::NOT_FOUND => Err(ImageServiceError::NotFound(what.to_string())),
            _ => Err(ImageServiceError::Api(format!("{}: {} - {}", what, status, body))),
        }
    }

    /// Builds metadata for a plain URL from a HEAD request
    async fn show_url(&self, url: &str) -> Result<ImageMetadata, ImageServiceError> {
        debug!("Fetching headers for image URL {}", url);
        let response = self
            .client
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let response = Self::check_status(response, url).await?;

        let mut image = ImageMetadata::new(url);
        image.size = response.content_length();
        image.updated_at = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(image)
    }
}

#[async_trait::async_trait]
impl ImageServiceTrait for ImageServiceClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn show(&self, image_href: &str) -> Result<ImageMetadata, ImageServiceError> {
        match ImageHref::parse(image_href) {
            Some(ImageHref::Service(id)) => {
                let url = self.image_url(&id);
                debug!("Fetching image metadata: {}", url);
                let response = self
                    .authorized(self.client.get(&url))
                    .header("Accept", "application/json")
                    .timeout(self.request_timeout)
                    .send()
                    .await?;
                let response = Self::check_status(response, &format!("image {}", id)).await?;
                let text = response.text().await?;
                let image: ImageMetadata = serde_json::from_str(&text)?;
                Ok(image)
            }
            Some(ImageHref::Url(url)) => self.show_url(&url).await,
            None => Err(ImageServiceError::InvalidHref(image_href.to_string())),
        }
    }

    async fn download(&self, image_href: &str, dest: &Path) -> Result<u64, ImageServiceError> {
        let request = match ImageHref::parse(image_href) {
            Some(ImageHref::Service(id)) => {
                self.authorized(self.client.get(format!("{}/file", self.image_url(&id))))
            }
            Some(ImageHref::Url(url)) => self.client.get(url),
            None => return Err(ImageServiceError::InvalidHref(image_href.to_string())),
        };

        debug!("Downloading {} to {}", image_href, dest.display());
        let response = request.send().await?;
        let response = Self::check_status(response, image_href).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;

        debug!("Downloaded {} bytes for {}", written, image_href);
        Ok(written)
    }
}
