//! Test utilities for unit testing the engine
//!
//! Recording and in-memory stand-ins for the DHCP backend, node store and
//! image converter, plus settings rooted in a temporary directory.

use crate::context::NodeBootContext;
use crate::dhcp::{DhcpOption, IpVersion};
use crate::error::{BootError, Result};
use crate::provider::{DhcpProvider, DhcpProviderKind, ImageConverter, NodeStore};
use crate::settings::Settings;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Settings with both roots and the image cache under `base`
pub fn test_settings(base: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.pxe.tftp_root = base.join("tftpboot");
    settings.deploy.http_root = base.join("httpboot");
    settings.deploy.http_url = Some("http://192.0.2.1:8080".to_string());
    settings.pxe.tftp_server = Some("192.0.2.1".to_string());
    settings.cache.master_path = Some(base.join("tftpboot").join("master_images"));
    settings.dhcp.timeout_secs = 5;
    settings
}

/// DHCP backend that records every update.
///
/// Like a real backend, each update replaces the node's current options.
#[derive(Debug)]
pub struct RecordingDhcpProvider {
    kind: DhcpProviderKind,
    addresses: Mutex<std::result::Result<Option<Vec<String>>, String>>,
    updates: Mutex<Vec<Vec<DhcpOption>>>,
    current: Mutex<HashMap<String, Vec<DhcpOption>>>,
    failing: AtomicBool,
}

impl RecordingDhcpProvider {
    pub fn new(kind: DhcpProviderKind) -> Self {
        Self {
            kind,
            addresses: Mutex::new(Ok(Some(Vec::new()))),
            updates: Mutex::new(Vec::new()),
            current: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn with_addresses(self, addresses: &[&str]) -> Self {
        *self.addresses.lock().unwrap() =
            Ok(Some(addresses.iter().map(|a| a.to_string()).collect()));
        self
    }

    /// Backend that cannot tell which addresses a node holds
    pub fn without_address_lookup(self) -> Self {
        *self.addresses.lock().unwrap() = Ok(None);
        self
    }

    pub fn with_lookup_error(self, reason: &str) -> Self {
        *self.addresses.lock().unwrap() = Err(reason.to_string());
        self
    }

    pub fn fail_updates(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Every option list pushed so far
    pub fn updates(&self) -> Vec<Vec<DhcpOption>> {
        self.updates.lock().unwrap().clone()
    }

    /// Options the backend currently holds for a node
    pub fn options_of(&self, node_uuid: &str) -> Vec<DhcpOption> {
        self.current
            .lock()
            .unwrap()
            .get(node_uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Current options of a node for one IP version
    pub fn options_for(&self, node_uuid: &str, version: IpVersion) -> Vec<DhcpOption> {
        self.options_of(node_uuid)
            .into_iter()
            .filter(|o| o.ip_version == version)
            .collect()
    }
}

#[async_trait::async_trait]
impl DhcpProvider for RecordingDhcpProvider {
    fn kind(&self) -> DhcpProviderKind {
        self.kind.clone()
    }

    async fn get_ip_addresses(&self, node: &NodeBootContext) -> Result<Option<Vec<String>>> {
        self.addresses
            .lock()
            .unwrap()
            .clone()
            .map_err(|reason| BootError::AddressLookupFailed {
                node: node.uuid.clone(),
                reason,
            })
    }

    async fn update_dhcp(&self, node: &NodeBootContext, options: &[DhcpOption]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BootError::DhcpUpdateFailed(format!(
                "backend rejected options for node {}",
                node.uuid
            )));
        }
        self.updates.lock().unwrap().push(options.to_vec());
        self.current
            .lock()
            .unwrap()
            .insert(node.uuid.clone(), options.to_vec());
        Ok(())
    }
}

/// Node store keeping records in memory
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    saved: Mutex<HashMap<String, (String, String)>>,
}

impl MemoryNodeStore {
    pub fn saved(&self, node_uuid: &str) -> Option<(String, String)> {
        self.saved.lock().unwrap().get(node_uuid).cloned()
    }
}

#[async_trait::async_trait]
impl NodeStore for MemoryNodeStore {
    async fn save_instance_images(&self, node_uuid: &str, kernel: &str, ramdisk: &str) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .insert(node_uuid.to_string(), (kernel.to_string(), ramdisk.to_string()));
        Ok(())
    }
}

/// Converter that copies the file and counts calls
#[derive(Debug, Default)]
pub struct CopyConverter {
    calls: AtomicUsize,
}

impl CopyConverter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ImageConverter for CopyConverter {
    async fn convert_to_raw(&self, source: &Path, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = tokio::fs::read(source).await?;
        tokio::fs::write(dest, format!("raw:{}", content.len())).await?;
        Ok(())
    }
}
