//! External collaborators
//!
//! The engine talks to the DHCP backend, the node record store and the
//! image converter only through these traits. All async methods must be
//! `Send` to work with Tokio's work-stealing runtime.

use crate::context::NodeBootContext;
use crate::dhcp::{DhcpCapabilities, DhcpOption};
use crate::error::{BootError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Backend family, which decides how address lookups are treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpProviderKind {
    /// No DHCP management; address lookups are best effort
    None,
    /// Backend with client-class tag support
    Neutron,
    Other(String),
}

impl DhcpProviderKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => DhcpProviderKind::None,
            "neutron" => DhcpProviderKind::Neutron,
            other => DhcpProviderKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DhcpProviderKind::None => "none",
            DhcpProviderKind::Neutron => "neutron",
            DhcpProviderKind::Other(name) => name,
        }
    }
}

/// DHCP backend operations
#[async_trait::async_trait]
pub trait DhcpProvider: Send + Sync {
    fn kind(&self) -> DhcpProviderKind;

    fn capabilities(&self) -> DhcpCapabilities {
        DhcpCapabilities {
            client_class_tags: self.kind() == DhcpProviderKind::Neutron,
        }
    }

    /// Addresses leased to the node's ports; `None` when the backend cannot tell
    async fn get_ip_addresses(&self, node: &NodeBootContext) -> Result<Option<Vec<String>>>;

    /// Replaces the node's boot options on the backend.
    ///
    /// `options` holds every IP version the node boots over; each option is
    /// tagged with its version.
    async fn update_dhcp(&self, node: &NodeBootContext, options: &[DhcpOption]) -> Result<()>;
}

/// Provider for deployments where DHCP is managed outside the engine
#[derive(Debug, Clone, Default)]
pub struct NoDhcpProvider;

#[async_trait::async_trait]
impl DhcpProvider for NoDhcpProvider {
    fn kind(&self) -> DhcpProviderKind {
        DhcpProviderKind::None
    }

    async fn get_ip_addresses(&self, _node: &NodeBootContext) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    async fn update_dhcp(&self, node: &NodeBootContext, options: &[DhcpOption]) -> Result<()> {
        debug!(
            "DHCP provider is none; not pushing {} options for node {}",
            options.len(),
            node.uuid
        );
        Ok(())
    }
}

/// Persistent node records
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Records the instance kernel and ramdisk resolved from the image service
    async fn save_instance_images(&self, node_uuid: &str, kernel: &str, ramdisk: &str)
    -> Result<()>;
}

/// Image format conversion
#[async_trait::async_trait]
pub trait ImageConverter: Send + Sync {
    /// Converts `source` to a raw image at `dest`
    async fn convert_to_raw(&self, source: &Path, dest: &Path) -> Result<()>;
}

/// Converts with `qemu-img convert`
#[derive(Debug, Clone)]
pub struct QemuImgConverter {
    binary: String,
}

impl Default for QemuImgConverter {
    fn default() -> Self {
        Self {
            binary: "qemu-img".to_string(),
        }
    }
}

impl QemuImgConverter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait::async_trait]
impl ImageConverter for QemuImgConverter {
    async fn convert_to_raw(&self, source: &Path, dest: &Path) -> Result<()> {
        info!("Converting {} to raw at {}", source.display(), dest.display());
        let output = Command::new(&self.binary)
            .arg("convert")
            .arg("-O")
            .arg("raw")
            .arg(source)
            .arg(dest)
            .output()
            .await
            .map_err(|e| BootError::Conversion(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BootError::Conversion(format!(
                "{} convert exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
