//! Boot file layout
//!
//! Pure mapping from node, MAC and IP identities to paths under the boot
//! roots. Nothing here touches the filesystem.
//!
//! ```text
//! <root>/<node-uuid>/config             canonical config
//! <root>/<node-uuid>/<label>            kernel, ramdisk, ...
//! <root>/<subdir>/01-aa-bb-cc-dd-ee-ff  legacy MAC alias (PXE)
//! <root>/<subdir>/aa-bb-cc-dd-ee-ff     MAC alias (iPXE, HTTP root)
//! <root>/aa:bb:cc:dd:ee:ff.conf         grub MAC alias
//! <tftp-root>/10.0.0.5.conf             grub IP alias
//! ```

use crate::context::{MacAddress, ProtocolMode};
use crate::error::{BootError, Result};
use crate::settings::Settings;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

/// Name of the rendered config inside a node directory
pub const CONFIG_FILE_NAME: &str = "config";

const ETHERNET_PREFIX: &str = "01-";
const INFINIBAND_PREFIX: &str = "20-";
const GRUB_SUFFIX: &str = ".conf";

/// Resolves boot file locations for a configured TFTP and HTTP root
#[derive(Debug, Clone)]
pub struct PathResolver {
    tftp_root: PathBuf,
    http_root: PathBuf,
    pxe_config_subdir: String,
    mac_delimiter: String,
}

impl PathResolver {
    pub fn new(tftp_root: impl Into<PathBuf>, http_root: impl Into<PathBuf>) -> Self {
        Self {
            tftp_root: tftp_root.into(),
            http_root: http_root.into(),
            pxe_config_subdir: "pxelinux.cfg".to_string(),
            mac_delimiter: "-".to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.pxe.tftp_root, &settings.deploy.http_root)
            .with_config_subdir(&settings.pxe.pxe_config_subdir)
    }

    pub fn with_config_subdir(mut self, subdir: &str) -> Self {
        self.pxe_config_subdir = subdir.trim_matches('/').to_string();
        self
    }

    pub fn with_mac_delimiter(mut self, delimiter: &str) -> Self {
        self.mac_delimiter = delimiter.to_string();
        self
    }

    pub fn tftp_root(&self) -> &Path {
        &self.tftp_root
    }

    pub fn http_root(&self) -> &Path {
        &self.http_root
    }

    pub fn config_subdir(&self) -> &str {
        &self.pxe_config_subdir
    }

    /// iPXE is served over HTTP, everything else over TFTP
    pub fn root(&self, protocol: ProtocolMode) -> &Path {
        match protocol {
            ProtocolMode::Ipxe => &self.http_root,
            ProtocolMode::Pxe => &self.tftp_root,
        }
    }

    /// Both roots, without duplicates
    pub fn roots(&self) -> Vec<&Path> {
        if self.tftp_root == self.http_root {
            vec![&self.tftp_root]
        } else {
            vec![&self.tftp_root, &self.http_root]
        }
    }

    pub fn node_dir(&self, node_uuid: &str, protocol: ProtocolMode) -> PathBuf {
        self.root(protocol).join(node_uuid)
    }

    pub fn config_path(&self, node_uuid: &str, protocol: ProtocolMode) -> PathBuf {
        self.node_dir(node_uuid, protocol).join(CONFIG_FILE_NAME)
    }

    /// Location of a node artifact such as `kernel` or `deploy_ramdisk`
    pub fn artifact_path(&self, node_uuid: &str, label: &str, protocol: ProtocolMode) -> PathBuf {
        self.node_dir(node_uuid, protocol).join(label)
    }

    pub fn config_dir(&self, protocol: ProtocolMode) -> PathBuf {
        self.root(protocol).join(&self.pxe_config_subdir)
    }

    /// Legacy (pxelinux/iPXE) MAC alias
    pub fn mac_path(
        &self,
        mac: &MacAddress,
        client_id: Option<&str>,
        protocol: ProtocolMode,
    ) -> PathBuf {
        let mut name = String::new();
        if protocol == ProtocolMode::Pxe {
            name.push_str(if client_id.is_some() {
                INFINIBAND_PREFIX
            } else {
                ETHERNET_PREFIX
            });
        }
        name.push_str(&mac.with_delimiter(&self.mac_delimiter));
        self.config_dir(protocol).join(name)
    }

    /// grub2 MAC alias, colon form kept
    pub fn grub_mac_path(&self, mac: &MacAddress, protocol: ProtocolMode) -> PathBuf {
        self.root(protocol)
            .join(format!("{}{}", mac.as_str(), GRUB_SUFFIX))
    }

    /// grub2 IP alias; always under the TFTP root
    pub fn ip_path(&self, ip: &str) -> Result<PathBuf> {
        let addr: IpAddr = ip.trim().parse().map_err(|_| {
            BootError::AddressResolution(format!("invalid IP address {:?}", ip))
        })?;
        Ok(self.tftp_root.join(format!("{}{}", addr, GRUB_SUFFIX)))
    }

    /// TFTP root with a trailing slash, as served in DHCP option 210
    pub fn tftp_path_prefix(&self) -> String {
        let mut prefix = self.tftp_root.to_string_lossy().into_owned();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix
    }

    /// Path of `file` relative to the TFTP root
    pub fn path_relative_to_tftp_root(&self, file: &Path) -> PathBuf {
        path_relative_to_root(&self.tftp_root, file)
    }
}

/// Joins a root-relative path back onto `root`
pub fn root_join(root: &Path, relative: &Path) -> PathBuf {
    normalize(&root.join(relative))
}

/// Path of `file` relative to `root`; a trailing slash on `root` is ignored
pub fn path_relative_to_root(root: &Path, file: &Path) -> PathBuf {
    relative_path(root, file)
}

/// Relative path leading from directory `from` to `to`
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from = normalize(from);
    let to = normalize(to);
    let from: Vec<Component<'_>> = from.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Target of a symlink at `link` pointing to `target`, relative to the link's directory
pub fn link_target(link: &Path, target: &Path) -> PathBuf {
    let dir = link.parent().unwrap_or_else(|| Path::new("/"));
    relative_path(dir, target)
}

/// Lexically normalizes `.` and `..` components
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Recovers the MAC address from a legacy alias file name
pub fn mac_from_legacy_name(name: &str, delimiter: &str) -> Option<MacAddress> {
    let expected = 12 + 5 * delimiter.len();
    let bare = [ETHERNET_PREFIX, INFINIBAND_PREFIX]
        .iter()
        .filter_map(|prefix| name.strip_prefix(*prefix))
        .find(|rest| rest.len() == expected)
        .unwrap_or(name);
    if bare.len() != expected || !bare.is_ascii() {
        return None;
    }
    let hex = if delimiter.is_empty() {
        bare.to_string()
    } else {
        bare.replace(delimiter, "")
    };
    if hex.len() != 12 {
        return None;
    }
    let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    octets.join(":").parse().ok()
}

/// Recovers the MAC address from a grub alias file name
pub fn mac_from_grub_name(name: &str) -> Option<MacAddress> {
    name.strip_suffix(GRUB_SUFFIX)?.parse().ok()
}
