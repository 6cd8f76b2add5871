//! Image Service Client
//!
//! Client for the remote image store that holds deploy, rescue and instance
//! images for bare-metal nodes. The PXE boot engine uses it to resolve
//! kernel/ramdisk identifiers from an instance image and to download boot
//! artifacts into its local cache.
//!
//! # Example
//!
//! ```no_run
//! use image_service_client::{ImageServiceClient, ImageServiceTrait};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ImageServiceClient::new(
//!     "http://images.example:9292".to_string(),
//!     Some("your-api-token".to_string()),
//! )?;
//!
//! // Resolve the kernel and ramdisk of an instance image
//! let image = client.show("4b0e0a2c-0a45-4f3c-8ab1-3b1d5b61f3e1").await?;
//! let kernel = image.property_str("kernel_id");
//!
//! // Stream an artifact to disk
//! client.download("glance://4b0e0a2c-0a45-4f3c-8ab1-3b1d5b61f3e1", Path::new("/tmp/kernel")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Image references
//!
//! An image reference ("href") is one of:
//! - a bare image UUID, resolved against the image service API
//! - `glance://<uuid>`, same as above
//! - an `http://` or `https://` URL, fetched directly

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod image_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::ImageServiceClient;
pub use error::ImageServiceError;
pub use models::*;
pub use image_trait::ImageServiceTrait;
#[cfg(feature = "test-util")]
pub use mock::MockImageService;
