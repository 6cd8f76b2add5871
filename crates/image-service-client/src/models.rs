//! Image service models
//!
//! The image record mirrors the v2 images API: well-known fields are typed,
//! every other key (including `kernel_id` and `ramdisk_id`) is kept in
//! `properties`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Prefix used by image references that point into the image service
pub const GLANCE_SCHEME: &str = "glance://";

/// Disk formats the boot engine cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Aki,
    Ari,
    Ami,
    Iso,
    #[serde(other)]
    Other,
}

impl DiskFormat {
    /// Whether an image in this format must be converted before it can be
    /// written raw to disk
    pub fn needs_conversion(&self) -> bool {
        matches!(self, DiskFormat::Qcow2)
    }
}

/// Image status as reported by the image service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Queued,
    Saving,
    #[default]
    Active,
    Killed,
    Deleted,
    Deactivated,
    #[serde(other)]
    Unknown,
}

/// Image metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_format: Option<DiskFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Free-form image properties (`kernel_id`, `ramdisk_id`, ...)
    #[serde(flatten)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl ImageMetadata {
    /// Minimal record for an image with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            status: ImageStatus::Active,
            disk_format: None,
            container_format: None,
            size: None,
            checksum: None,
            updated_at: None,
            properties: HashMap::new(),
        }
    }

    /// Sets a string property
    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties
            .insert(key.to_string(), serde_json::Value::String(value.into()));
        self
    }

    /// Returns a property as a string, if present and non-null
    pub fn property_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Kind of an image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageHref {
    /// Image stored in the image service
    Service(Uuid),
    /// Plain HTTP(S) location
    Url(String),
}

impl ImageHref {
    /// Classifies an image reference
    pub fn parse(href: &str) -> Option<Self> {
        let trimmed = href.trim();
        let candidate = trimmed.strip_prefix(GLANCE_SCHEME).unwrap_or(trimmed);
        if let Ok(id) = Uuid::parse_str(candidate) {
            return Some(ImageHref::Service(id));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(ImageHref::Url(trimmed.to_string()));
        }
        None
    }
}

/// Returns the image id when the reference points into the image service
pub fn parse_image_id(href: &str) -> Option<String> {
    match ImageHref::parse(href)? {
        ImageHref::Service(id) => Some(id.to_string()),
        ImageHref::Url(_) => None,
    }
}
