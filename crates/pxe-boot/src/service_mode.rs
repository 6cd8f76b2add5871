//! In-place switch of a boot config to service mode
//!
//! Deployment leaves `ROOT`/`DISK_IDENTIFIER` placeholders in the config
//! and boots the `deploy` section. Once the instance is on disk the same
//! file is edited: placeholders become the real identifier and the default
//! section becomes the instance's boot target. Everything else in the file,
//! including manual edits, is left alone.

use crate::error::{BootError, Result};
use crate::fsutil;
use crate::policy::{BootPolicy, BootSource};
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const ROOT_PATTERN: &str = r"(\(\(|\{\{) ROOT (\)\)|\}\})";
const DISK_IDENTIFIER_PATTERN: &str = r"(\(\(|\{\{) DISK_IDENTIFIER (\)\)|\}\})";

/// Rewrites `content` for service mode
pub fn switch_content(
    content: &str,
    root_identifier: Option<&str>,
    policy: &BootPolicy,
) -> Result<String> {
    let mut content = content.to_string();

    if policy.source != BootSource::Ramdisk {
        if let Some(identifier) = root_identifier {
            if policy.is_whole_disk() {
                let re = Regex::new(DISK_IDENTIFIER_PATTERN)?;
                content = re.replace_all(&content, regex::NoExpand(identifier)).into_owned();
            } else {
                let re = Regex::new(ROOT_PATTERN)?;
                let root = format!("UUID={}", identifier);
                content = re.replace_all(&content, regex::NoExpand(&root)).into_owned();
            }
        }
    }

    let label = policy.boot_target().label();
    content = if policy.uses_grub() {
        let re = Regex::new(r"(?m)^((set )?default)=.*$")?;
        re.replace(&content, format!("${{1}}={}", label).as_str())
            .into_owned()
    } else {
        let command = if policy.is_ipxe() { "goto" } else { "default" };
        let re = Regex::new(&format!(r"(?m)^{} .*$", command))?;
        re.replace(&content, regex::NoExpand(&format!("{} {}", command, label)))
            .into_owned()
    };
    Ok(content)
}

/// Switches the config at `path` to service mode, writing only on change
pub fn switch_config(path: &Path, root_identifier: Option<&str>, policy: &BootPolicy) -> Result<()> {
    let current = fs::read_to_string(path).map_err(BootError::fs(path))?;
    let switched = switch_content(&current, root_identifier, policy)?;
    if switched == current {
        debug!("Boot config {} already in service mode", path.display());
        return Ok(());
    }
    fsutil::write_atomic(path, switched.as_bytes())?;
    info!(
        "Switched boot config {} to {}",
        path.display(),
        policy.boot_target().label()
    );
    Ok(())
}
