//! Engine configuration
//!
//! Settings are read from an optional YAML file and then overridden by
//! `PXE_*` environment variables. Every group has serde defaults so a
//! partial file is enough.

use crate::dhcp::IpVersion;
use crate::error::{BootError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pxe: PxeSettings,
    pub deploy: DeploySettings,
    pub dhcp: DhcpSettings,
    pub cache: CacheSettings,
    pub conductor: ConductorSettings,
    pub image_service: ImageServiceSettings,
    /// Adds `ipa-debug=1` to the kernel command line of deploy ramdisks
    pub debug: bool,
}

/// Boot file names, roots and templates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PxeSettings {
    pub tftp_root: PathBuf,
    /// TFTP server address handed to firmware; falls back to `my_ip`
    pub tftp_server: Option<String>,
    pub my_ip: String,
    /// Host used in IPv6 boot-file URLs
    pub my_ipv6: Option<String>,
    pub pxe_config_subdir: String,
    /// Octal mode applied to directories the engine creates
    pub dir_permission: Option<u32>,
    pub pxe_bootfile_name: String,
    pub uefi_pxe_bootfile_name: String,
    pub ipxe_bootfile_name: String,
    pub uefi_ipxe_bootfile_name: String,
    pub pxe_config_template: Option<PathBuf>,
    pub uefi_pxe_config_template: Option<PathBuf>,
    pub ipxe_config_template: Option<PathBuf>,
    pub ipxe_boot_script: Option<PathBuf>,
    pub pxe_append_params: String,
    /// Seconds; 0 disables the iPXE HTTP timeout
    pub ipxe_timeout: u64,
    pub ip_version: IpVersion,
    pub url_boot: bool,
}

impl Default for PxeSettings {
    fn default() -> Self {
        Self {
            tftp_root: PathBuf::from("/tftpboot"),
            tftp_server: None,
            my_ip: "127.0.0.1".to_string(),
            my_ipv6: None,
            pxe_config_subdir: "pxelinux.cfg".to_string(),
            dir_permission: None,
            pxe_bootfile_name: "pxelinux.0".to_string(),
            uefi_pxe_bootfile_name: "bootx64.efi".to_string(),
            ipxe_bootfile_name: "undionly.kpxe".to_string(),
            uefi_ipxe_bootfile_name: "ipxe.efi".to_string(),
            pxe_config_template: None,
            uefi_pxe_config_template: None,
            ipxe_config_template: None,
            ipxe_boot_script: None,
            pxe_append_params: "nofb nomodeset vga=normal".to_string(),
            ipxe_timeout: 0,
            ip_version: IpVersion::V4,
            url_boot: false,
        }
    }
}

impl PxeSettings {
    /// Effective TFTP server address
    pub fn tftp_server(&self) -> &str {
        self.tftp_server.as_deref().unwrap_or(&self.my_ip)
    }
}

/// HTTP side of iPXE boots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub http_root: PathBuf,
    pub http_url: Option<String>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            http_root: PathBuf::from("/httpboot"),
            http_url: None,
        }
    }
}

/// DHCP backend limits; the backend itself is injected as a `DhcpProvider`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpSettings {
    /// Bound on every call to the DHCP backend
    pub timeout_secs: u64,
}

impl Default for DhcpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
        }
    }
}

impl DhcpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Master image cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Without a master path images are downloaded straight into node directories
    pub master_path: Option<PathBuf>,
    /// 0 means unbounded
    pub size_mib: u64,
    /// 0 disables age-based eviction
    pub ttl_minutes: u64,
    pub force_raw_images: bool,
    pub download_timeout_secs: u64,
    /// Interval between janitor sweeps
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            master_path: Some(PathBuf::from("/tftpboot/master_images")),
            size_mib: 20480,
            ttl_minutes: 10080,
            force_raw_images: true,
            download_timeout_secs: 1800,
            sweep_interval_secs: 600,
        }
    }
}

impl CacheSettings {
    pub fn size_bytes(&self) -> u64 {
        self.size_mib.saturating_mul(1024 * 1024)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Fallback deploy and rescue images used when a node names none
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorSettings {
    pub deploy_kernel: Option<String>,
    pub deploy_ramdisk: Option<String>,
    pub rescue_kernel: Option<String>,
    pub rescue_ramdisk: Option<String>,
}

/// Remote image store endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageServiceSettings {
    pub url: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ImageServiceSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9292".to_string(),
            token: None,
            timeout_secs: 60,
        }
    }
}

impl ImageServiceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    /// Loads settings from `path` (if any), then applies `PXE_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses a YAML settings file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(BootError::fs(path))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Applies overrides from a key lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("PXE_TFTP_ROOT") {
            self.pxe.tftp_root = PathBuf::from(v);
        }
        if let Some(v) = get("PXE_TFTP_SERVER") {
            self.pxe.tftp_server = Some(v);
        }
        if let Some(v) = get("PXE_MY_IP") {
            self.pxe.my_ip = v;
        }
        if let Some(v) = get("PXE_MY_IPV6") {
            self.pxe.my_ipv6 = Some(v);
        }
        if let Some(v) = get("PXE_CONFIG_SUBDIR") {
            self.pxe.pxe_config_subdir = v;
        }
        if let Some(v) = get("PXE_DIR_PERMISSION") {
            let digits = v.trim_start_matches("0o");
            let mode = u32::from_str_radix(digits, 8).map_err(|e| {
                BootError::Configuration(format!("PXE_DIR_PERMISSION {:?}: {}", v, e))
            })?;
            self.pxe.dir_permission = Some(mode);
        }
        if let Some(v) = get("PXE_APPEND_PARAMS") {
            self.pxe.pxe_append_params = v;
        }
        if let Some(v) = get("PXE_IPXE_TIMEOUT") {
            self.pxe.ipxe_timeout = parse_number("PXE_IPXE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PXE_IP_VERSION") {
            self.pxe.ip_version = v.parse()?;
        }
        if let Some(v) = get("PXE_URL_BOOT") {
            self.pxe.url_boot = parse_bool("PXE_URL_BOOT", &v)?;
        }
        if let Some(v) = get("PXE_IPXE_BOOT_SCRIPT") {
            self.pxe.ipxe_boot_script = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PXE_HTTP_ROOT") {
            self.deploy.http_root = PathBuf::from(v);
        }
        if let Some(v) = get("PXE_HTTP_URL") {
            self.deploy.http_url = Some(v);
        }
        if let Some(v) = get("PXE_DHCP_TIMEOUT") {
            self.dhcp.timeout_secs = parse_number("PXE_DHCP_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PXE_IMAGE_CACHE_PATH") {
            self.cache.master_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PXE_IMAGE_CACHE_SIZE_MIB") {
            self.cache.size_mib = parse_number("PXE_IMAGE_CACHE_SIZE_MIB", &v)?;
        }
        if let Some(v) = get("PXE_IMAGE_CACHE_TTL_MINUTES") {
            self.cache.ttl_minutes = parse_number("PXE_IMAGE_CACHE_TTL_MINUTES", &v)?;
        }
        if let Some(v) = get("PXE_FORCE_RAW_IMAGES") {
            self.cache.force_raw_images = parse_bool("PXE_FORCE_RAW_IMAGES", &v)?;
        }
        if let Some(v) = get("PXE_CACHE_SWEEP_INTERVAL") {
            self.cache.sweep_interval_secs = parse_number("PXE_CACHE_SWEEP_INTERVAL", &v)?;
        }
        if let Some(v) = get("PXE_DEPLOY_KERNEL") {
            self.conductor.deploy_kernel = Some(v);
        }
        if let Some(v) = get("PXE_DEPLOY_RAMDISK") {
            self.conductor.deploy_ramdisk = Some(v);
        }
        if let Some(v) = get("PXE_RESCUE_KERNEL") {
            self.conductor.rescue_kernel = Some(v);
        }
        if let Some(v) = get("PXE_RESCUE_RAMDISK") {
            self.conductor.rescue_ramdisk = Some(v);
        }
        if let Some(v) = get("IMAGE_SERVICE_URL") {
            self.image_service.url = v;
        }
        if let Some(v) = get("IMAGE_SERVICE_TOKEN") {
            self.image_service.token = Some(v);
        }
        if let Some(v) = get("PXE_DEBUG") {
            self.debug = parse_bool("PXE_DEBUG", &v)?;
        }
        Ok(())
    }

    /// Rejects settings the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.pxe.tftp_root.is_absolute() {
            return Err(BootError::Configuration(format!(
                "tftp_root must be absolute, got {}",
                self.pxe.tftp_root.display()
            )));
        }
        if !self.deploy.http_root.is_absolute() {
            return Err(BootError::Configuration(format!(
                "http_root must be absolute, got {}",
                self.deploy.http_root.display()
            )));
        }
        if let Some(master) = &self.cache.master_path {
            if !master.is_absolute() {
                return Err(BootError::Configuration(format!(
                    "image cache path must be absolute, got {}",
                    master.display()
                )));
            }
        }
        if self.pxe.pxe_config_subdir.is_empty()
            || self.pxe.pxe_config_subdir.contains("..")
            || self.pxe.pxe_config_subdir.starts_with('/')
        {
            return Err(BootError::Configuration(format!(
                "invalid pxe_config_subdir {:?}",
                self.pxe.pxe_config_subdir
            )));
        }
        if let Some(mode) = self.pxe.dir_permission {
            if mode > 0o7777 {
                return Err(BootError::Configuration(format!(
                    "dir_permission {:o} is not a valid mode",
                    mode
                )));
            }
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| BootError::Configuration(format!("{} {:?}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BootError::Configuration(format!(
            "{} expects a boolean, got {:?}",
            key, value
        ))),
    }
}
