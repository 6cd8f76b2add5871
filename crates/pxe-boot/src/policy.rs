//! Boot policy
//!
//! Boot mode, protocol and boot source are resolved once per operation
//! into a [`BootPolicy`]. Every later decision (template, placeholders,
//! alias set, boot target line) reads the policy instead of the context.

use crate::context::{BootMode, BootOption, NodeBootContext, ProtocolMode};
use crate::error::{BootError, Result};

/// What the deployed node boots from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSource {
    /// Deployed image; kernel and ramdisk are netbooted unless whole-disk
    Image { whole_disk: bool },
    /// Remote iSCSI volume
    Volume,
    /// Instance runs from the ramdisk
    Ramdisk,
    /// Local disk bootloader, no network boot after deployment
    Local,
}

/// Label of the boot section selected in service mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTarget {
    WholeDisk,
    Trusted,
    Iscsi,
    Ramdisk,
    Partition,
}

impl BootTarget {
    pub fn label(&self) -> &'static str {
        match self {
            BootTarget::WholeDisk => "boot_whole_disk",
            BootTarget::Trusted => "trusted_boot",
            BootTarget::Iscsi => "boot_iscsi",
            BootTarget::Ramdisk => "boot_ramdisk",
            BootTarget::Partition => "boot_partition",
        }
    }
}

/// Placeholder tokens a template leaves for deployment-time values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholders {
    pub root: &'static str,
    pub disk_identifier: &'static str,
}

const GRUB_PLACEHOLDERS: Placeholders = Placeholders {
    root: "(( ROOT ))",
    disk_identifier: "(( DISK_IDENTIFIER ))",
};

const JINJA_PLACEHOLDERS: Placeholders = Placeholders {
    root: "{{ ROOT }}",
    disk_identifier: "{{ DISK_IDENTIFIER }}",
};

/// Resolved boot policy of one node for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPolicy {
    pub boot_mode: BootMode,
    pub protocol: ProtocolMode,
    pub source: BootSource,
    pub trusted_boot: bool,
}

impl BootPolicy {
    /// Resolves the policy without validation; used on clean-up paths
    pub fn from_context(ctx: &NodeBootContext) -> Self {
        let source = if ctx.boot_volume.is_some() {
            BootSource::Volume
        } else {
            match ctx.boot_option {
                BootOption::Ramdisk => BootSource::Ramdisk,
                BootOption::Local => BootSource::Local,
                BootOption::Netboot => BootSource::Image {
                    whole_disk: ctx.is_whole_disk_image,
                },
            }
        };
        Self {
            boot_mode: ctx.boot_mode,
            protocol: ctx.protocol,
            source,
            trusted_boot: ctx.trusted_boot,
        }
    }

    /// Resolves and validates the policy
    ///
    /// Trusted boot needs a measured kernel/ramdisk chain, so it is only
    /// accepted for BIOS netboot of partition images.
    pub fn resolve(ctx: &NodeBootContext) -> Result<Self> {
        let policy = Self::from_context(ctx);
        if policy.trusted_boot {
            if policy.boot_mode != BootMode::Bios {
                return Err(BootError::InvalidParameter(format!(
                    "node {}: trusted boot is only supported in BIOS boot mode",
                    ctx.uuid
                )));
            }
            if policy.source != (BootSource::Image { whole_disk: false }) {
                return Err(BootError::InvalidParameter(format!(
                    "node {}: trusted boot requires netboot of a partition image",
                    ctx.uuid
                )));
            }
        }
        Ok(policy)
    }

    pub fn is_ipxe(&self) -> bool {
        self.protocol == ProtocolMode::Ipxe
    }

    /// UEFI firmware chainloading grub2 over TFTP
    pub fn uses_grub(&self) -> bool {
        self.boot_mode == BootMode::Uefi && !self.is_ipxe()
    }

    pub fn is_whole_disk(&self) -> bool {
        self.source == BootSource::Image { whole_disk: true }
    }

    pub fn placeholders(&self) -> Placeholders {
        if self.uses_grub() {
            GRUB_PLACEHOLDERS
        } else {
            JINJA_PLACEHOLDERS
        }
    }

    /// Section selected when the node switches to service mode
    pub fn boot_target(&self) -> BootTarget {
        match self.source {
            BootSource::Image { whole_disk: true } => BootTarget::WholeDisk,
            _ if self.trusted_boot => BootTarget::Trusted,
            BootSource::Volume => BootTarget::Iscsi,
            BootSource::Ramdisk => BootTarget::Ramdisk,
            BootSource::Image { .. } | BootSource::Local => BootTarget::Partition,
        }
    }
}
