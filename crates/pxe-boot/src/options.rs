//! Boot config parameters
//!
//! Everything a template can reference under `pxe_options`. Fields that do
//! not apply are left out of the serialized form, so templates see them as
//! undefined (empty) rather than as `none`.

use crate::artifacts::{ArtifactSet, RamdiskMode, KERNEL, RAMDISK};
use crate::context::{NodeBootContext, ProtocolMode};
use crate::dhcp::wrap_ipv6;
use crate::error::{BootError, Result};
use crate::paths::{path_relative_to_root, PathResolver};
use crate::policy::{BootPolicy, BootSource};
use crate::settings::Settings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

const NO_KERNEL: &str = "no_kernel";
const NO_RAMDISK: &str = "no_ramdisk";
const DEFAULT_ISCSI_PORT: &str = "3260";

/// Parameters rendered into a boot config template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootConfigParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_aki_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_ari_path: Option<String>,
    /// Ramdisk file name the iPXE kernel line refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aki_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ari_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramdisk_opts: Option<String>,
    pub pxe_append_params: String,
    pub tftp_server: String,
    /// Milliseconds
    pub ipxe_timeout: u64,
    pub boot_from_volume: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iscsi_boot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iscsi_initiator_iqn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub iscsi_volumes: Vec<IscsiVolume>,
}

/// Additional iSCSI volume hooked before booting the boot volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IscsiVolume {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Builds [`BootConfigParams`] from node state and settings
#[derive(Debug, Clone)]
pub struct ParamsBuilder {
    paths: PathResolver,
    http_url: Option<String>,
    append_params: String,
    tftp_server: String,
    ipxe_timeout_secs: u64,
    debug: bool,
}

impl ParamsBuilder {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            paths: PathResolver::from_settings(settings),
            http_url: settings.deploy.http_url.clone(),
            append_params: settings.pxe.pxe_append_params.clone(),
            tftp_server: settings.pxe.tftp_server().to_string(),
            ipxe_timeout_secs: settings.pxe.ipxe_timeout,
            debug: settings.debug,
        }
    }

    /// How the firmware or boot loader addresses an artifact file
    fn location(&self, path: &Path, protocol: ProtocolMode) -> Result<String> {
        match protocol {
            ProtocolMode::Pxe => Ok(self
                .paths
                .path_relative_to_tftp_root(path)
                .to_string_lossy()
                .into_owned()),
            ProtocolMode::Ipxe => {
                let base = self.http_url.as_deref().ok_or_else(|| {
                    BootError::Configuration("http_url is required for iPXE boot".to_string())
                })?;
                let relative = path_relative_to_root(self.paths.http_root(), path);
                Ok(format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    relative.to_string_lossy()
                ))
            }
        }
    }

    /// Deploy or rescue ramdisk entries
    pub fn deploy_options(
        &self,
        params: &mut BootConfigParams,
        artifacts: &ArtifactSet,
        mode: RamdiskMode,
        protocol: ProtocolMode,
    ) -> Result<()> {
        let (kernel_label, ramdisk_label) = mode.labels();
        let (Some(kernel), Some(ramdisk)) = (artifacts.get(kernel_label), artifacts.get(ramdisk_label))
        else {
            return Err(BootError::ArtifactMissing(format!(
                "{} and {} are required",
                kernel_label, ramdisk_label
            )));
        };
        params.deployment_aki_path = Some(self.location(&kernel.path, protocol)?);
        params.deployment_ari_path = Some(self.location(&ramdisk.path, protocol)?);
        if protocol == ProtocolMode::Ipxe {
            params.initrd_filename = Some(ramdisk_label.to_string());
        }
        Ok(())
    }

    /// Instance kernel and ramdisk entries; placeholders when the image brings none
    pub fn instance_options(
        &self,
        params: &mut BootConfigParams,
        ctx: &NodeBootContext,
        artifacts: &ArtifactSet,
        protocol: ProtocolMode,
    ) -> Result<()> {
        params.aki_path = Some(match artifacts.get(KERNEL) {
            Some(kernel) => self.location(&kernel.path, protocol)?,
            None => NO_KERNEL.to_string(),
        });
        params.ari_path = Some(match artifacts.get(RAMDISK) {
            Some(ramdisk) => self.location(&ramdisk.path, protocol)?,
            None => NO_RAMDISK.to_string(),
        });
        params.ramdisk_opts = ctx.instance_info.ramdisk_kernel_arguments.clone();
        Ok(())
    }

    /// Kernel command line, server address and iPXE timeout
    pub fn extra_options(
        &self,
        params: &mut BootConfigParams,
        ramdisk_params: &BTreeMap<String, String>,
    ) {
        let mut append = self.append_params.clone();
        if self.debug {
            push_param(&mut append, "ipa-debug=1");
        }
        for (key, value) in ramdisk_params {
            push_param(&mut append, &format!("{}={}", key, value));
        }
        params.pxe_append_params = append;
        params.tftp_server = self.tftp_server.clone();
        params.ipxe_timeout = self.ipxe_timeout_secs.saturating_mul(1000);
    }

    /// iSCSI boot-from-volume entries
    pub fn volume_options(&self, params: &mut BootConfigParams, ctx: &NodeBootContext) -> Result<()> {
        let volume = ctx.boot_volume.as_ref().ok_or_else(|| {
            BootError::InvalidParameter(format!("node {} has no boot volume", ctx.uuid))
        })?;
        let target = volume.boot_target().ok_or_else(|| {
            BootError::InvalidParameter(format!("node {} has no volume with boot index 0", ctx.uuid))
        })?;

        params.boot_from_volume = true;
        params.iscsi_boot_url = Some(iscsi_url(&ctx.uuid, target)?);
        params.username = target.property_str("auth_username");
        params.password = target.property_str("auth_password");
        params.iscsi_initiator_iqn = volume.iqn_connector().map(|c| c.connector_id.clone());

        let mut extra: Vec<_> = volume
            .targets
            .iter()
            .filter(|t| t.boot_index != 0 && t.volume_type == "iscsi")
            .collect();
        extra.sort_by_key(|t| t.boot_index);
        params.iscsi_volumes = extra
            .into_iter()
            .map(|t| {
                Ok(IscsiVolume {
                    url: iscsi_url(&ctx.uuid, t)?,
                    username: t.property_str("auth_username"),
                    password: t.property_str("auth_password"),
                })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Full parameter set for a ramdisk boot (`service == false`) or the
    /// deployed instance (`service == true`)
    pub fn build(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        artifacts: &ArtifactSet,
        mode: RamdiskMode,
        service: bool,
        ramdisk_params: &BTreeMap<String, String>,
    ) -> Result<BootConfigParams> {
        let mut params = BootConfigParams::default();
        if !service {
            self.deploy_options(&mut params, artifacts, mode, policy.protocol)?;
        }
        if policy.source == BootSource::Volume {
            self.volume_options(&mut params, ctx)?;
        } else {
            self.instance_options(&mut params, ctx, artifacts, policy.protocol)?;
        }
        self.extra_options(&mut params, ramdisk_params);
        Ok(params)
    }
}

fn push_param(append: &mut String, param: &str) {
    if !append.is_empty() {
        append.push(' ');
    }
    append.push_str(param);
}

/// `iscsi:<host>::<port>:<lun>:<iqn>` for a volume target
fn iscsi_url(node: &str, target: &crate::context::VolumeTarget) -> Result<String> {
    let missing = |key: &str| {
        BootError::InvalidParameter(format!(
            "node {}: volume target {} lacks {}",
            node, target.boot_index, key
        ))
    };
    let portal = target
        .property_str("target_portal")
        .ok_or_else(|| missing("target_portal"))?;
    let iqn = target
        .property_str("target_iqn")
        .ok_or_else(|| missing("target_iqn"))?;
    let lun = match target.properties.get("target_lun") {
        Some(serde_json::Value::Array(luns)) => luns.first().map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        _ => target.property_str("target_lun"),
    }
    .unwrap_or_else(|| "0".to_string());

    let (host, port) = split_portal(&portal);
    Ok(format!("iscsi:{}::{}:{}:{}", wrap_ipv6(host), port, lun, iqn))
}

/// Splits `host:port`, `[v6]:port`, a bare host or a bare IPv6 literal
fn split_portal(portal: &str) -> (&str, &str) {
    if let Some(rest) = portal.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').unwrap_or(DEFAULT_ISCSI_PORT);
            return (host, port);
        }
    }
    if portal.matches(':').count() == 1 {
        if let Some((host, port)) = portal.split_once(':') {
            return (host, port);
        }
    }
    (portal, DEFAULT_ISCSI_PORT)
}
