//! PXE Boot Engine
//!
//! Network-boot configuration for bare-metal nodes. Given a node snapshot
//! the engine renders the boot-loader config its firmware fetches over TFTP
//! or HTTP, publishes it under every MAC/IP name the firmware may ask for,
//! computes the DHCP options that point the firmware at its boot file and
//! keeps a hard-linked cache of kernel/ramdisk images.
//!
//! # Example
//!
//! ```no_run
//! use image_service_client::ImageServiceClient;
//! use pxe_boot::{
//!     BootOrchestrator, Collaborators, NoDhcpProvider, NodeBootContext, NodeStore,
//!     QemuImgConverter, RamdiskMode, Settings,
//! };
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example(nodes: Arc<dyn NodeStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load(None)?;
//! let images = ImageServiceClient::new(settings.image_service.url.clone(), None)?;
//! let orchestrator = BootOrchestrator::new(
//!     &settings,
//!     Collaborators {
//!         dhcp: Arc::new(NoDhcpProvider),
//!         images: Arc::new(images),
//!         nodes,
//!         converter: Arc::new(QemuImgConverter::default()),
//!     },
//! )?;
//!
//! let mut node = NodeBootContext::new("1be26c0b-03f2-4d2e-ae87-c02d7f33c123")
//!     .with_port("52:54:00:12:34:56")?;
//! node.driver_info.deploy_kernel = Some("glance://a1b2c3d4-0000-4000-8000-000000000001".to_string());
//! node.driver_info.deploy_ramdisk = Some("glance://a1b2c3d4-0000-4000-8000-000000000002".to_string());
//!
//! // Boot the deploy agent
//! orchestrator
//!     .prepare_ramdisk_boot(&node, RamdiskMode::Deploy, &BTreeMap::new())
//!     .await?;
//!
//! // Once deployed, point the same config at the instance
//! node.root_uuid_or_disk_id = Some("7f3c2a10-5b7e-4c1d-9a8e-2f6b3c4d5e6f".to_string());
//! let outcome = orchestrator.prepare_instance_boot(&node).await?;
//! println!("boot device: {:?}", outcome.boot_device);
//! # Ok(())
//! # }
//! ```
//!
//! # Layout
//!
//! - `<root>/<node-uuid>/config`: canonical boot config
//! - `<root>/<node-uuid>/<label>`: hard links to cached images
//! - `<root>/<pxe-config-subdir>/01-<mac>`: legacy MAC aliases
//! - `<root>/<mac>.conf`, `<tftp-root>/<ip>.conf`: grub aliases
//!
//! `<root>` is the HTTP root for iPXE nodes and the TFTP root otherwise.

pub mod artifacts;
pub mod context;
pub mod dhcp;
pub mod error;
pub mod fsutil;
pub mod image_cache;
pub mod options;
pub mod orchestrator;
pub mod paths;
pub mod policy;
pub mod provider;
pub mod render;
pub mod service_mode;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use artifacts::{ArtifactResolver, ArtifactSet, ImageReference, RamdiskMode};
pub use context::{
    BootMode, BootOption, BootVolume, DriverInfo, InstanceInfo, MacAddress, NodeBootContext,
    Port, ProtocolMode, ProvisionState,
};
pub use dhcp::{DhcpOption, DhcpOptionBuilder, DhcpOptionCode, IpVersion};
pub use error::{BootError, Result};
pub use image_cache::{CacheEntry, CleanupReport, ImageCache};
pub use options::BootConfigParams;
pub use orchestrator::{BootDevice, BootOrchestrator, BootStage, Collaborators, PrepareOutcome};
pub use paths::PathResolver;
pub use policy::BootPolicy;
pub use provider::{DhcpProvider, DhcpProviderKind, ImageConverter, NoDhcpProvider, NodeStore, QemuImgConverter};
pub use render::{AliasReport, BootConfigRenderer, BootTemplate};
pub use settings::Settings;
