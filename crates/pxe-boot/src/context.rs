//! Node boot context
//!
//! An immutable snapshot of everything the engine needs to know about a
//! node for one operation. The engine never mutates it; resolved instance
//! image references are written back through [`crate::NodeStore`].

use crate::error::{BootError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Firmware boot mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    #[default]
    Bios,
    Uefi,
}

/// Network boot protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Pxe,
    Ipxe,
}

/// How the deployed instance boots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootOption {
    #[default]
    Netboot,
    Local,
    Ramdisk,
}

/// Provisioning state of the node at the time of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionState {
    #[default]
    Available,
    Deploying,
    DeployWait,
    Active,
    Rebooting,
    Rescuing,
    RescueWait,
    Rescue,
    Unrescuing,
    Cleaning,
    CleanWait,
}

impl ProvisionState {
    /// States where a missing boot config is rebuilt before switching to
    /// service mode (conductor takeover, reboots, unrescue)
    pub fn rebuilds_missing_config(&self) -> bool {
        matches!(
            self,
            ProvisionState::Active
                | ProvisionState::Rebooting
                | ProvisionState::Unrescuing
                | ProvisionState::Deploying
        )
    }

    /// Whether a ramdisk boot in this state is a rescue boot
    pub fn is_rescue(&self) -> bool {
        matches!(self, ProvisionState::Rescuing | ProvisionState::RescueWait)
    }
}

/// Lowercase colon-separated MAC address
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address with `:` replaced by `delimiter`
    pub fn with_delimiter(&self, delimiter: &str) -> String {
        self.0.replace(':', delimiter)
    }
}

impl FromStr for MacAddress {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self> {
        let octets: Vec<&str> = s.trim().split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(BootError::AddressResolution(format!(
                "invalid MAC address {:?}",
                s
            )));
        }
        Ok(MacAddress(octets.join(":").to_ascii_lowercase()))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = BootError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A network port of the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub address: MacAddress,
    /// Present on InfiniBand ports
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Instance image references recorded on the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceInfo {
    pub image_source: Option<String>,
    pub kernel: Option<String>,
    pub ramdisk: Option<String>,
    pub ramdisk_kernel_arguments: Option<String>,
}

/// Per-node driver parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverInfo {
    pub deploy_kernel: Option<String>,
    pub deploy_ramdisk: Option<String>,
    pub rescue_kernel: Option<String>,
    pub rescue_ramdisk: Option<String>,
    pub pxe_bootfile_name: Option<String>,
    pub uefi_pxe_bootfile_name: Option<String>,
    pub pxe_template: Option<String>,
}

/// A volume target attached to the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeTarget {
    pub volume_type: String,
    pub boot_index: u32,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl VolumeTarget {
    pub fn property_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A volume connector of the node (initiator side)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConnector {
    pub connector_type: String,
    pub connector_id: String,
}

/// Boot-from-volume description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootVolume {
    pub targets: Vec<VolumeTarget>,
    pub connectors: Vec<VolumeConnector>,
}

impl BootVolume {
    /// The target with boot index 0
    pub fn boot_target(&self) -> Option<&VolumeTarget> {
        self.targets.iter().find(|t| t.boot_index == 0)
    }

    pub fn iqn_connector(&self) -> Option<&VolumeConnector> {
        self.connectors.iter().find(|c| c.connector_type == "iqn")
    }
}

/// Snapshot of a node for one boot operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBootContext {
    pub uuid: String,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub boot_mode: BootMode,
    #[serde(default)]
    pub protocol: ProtocolMode,
    #[serde(default)]
    pub is_whole_disk_image: bool,
    #[serde(default)]
    pub boot_option: BootOption,
    #[serde(default)]
    pub provision_state: ProvisionState,
    #[serde(default)]
    pub instance_info: InstanceInfo,
    #[serde(default)]
    pub driver_info: DriverInfo,
    /// Root partition UUID or disk identifier recorded by deployment
    #[serde(default)]
    pub root_uuid_or_disk_id: Option<String>,
    #[serde(default)]
    pub trusted_boot: bool,
    #[serde(default)]
    pub boot_volume: Option<BootVolume>,
}

impl NodeBootContext {
    /// A BIOS/PXE netboot node with no ports
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ports: Vec::new(),
            boot_mode: BootMode::Bios,
            protocol: ProtocolMode::Pxe,
            is_whole_disk_image: false,
            boot_option: BootOption::Netboot,
            provision_state: ProvisionState::Available,
            instance_info: InstanceInfo::default(),
            driver_info: DriverInfo::default(),
            root_uuid_or_disk_id: None,
            trusted_boot: false,
            boot_volume: None,
        }
    }

    pub fn with_port(mut self, mac: &str) -> Result<Self> {
        self.ports.push(Port {
            address: mac.parse()?,
            client_id: None,
        });
        Ok(self)
    }

    pub fn with_boot_mode(mut self, boot_mode: BootMode) -> Self {
        self.boot_mode = boot_mode;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolMode) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn is_ipxe(&self) -> bool {
        self.protocol == ProtocolMode::Ipxe
    }
}
