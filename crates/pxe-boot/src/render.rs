//! Boot config rendering and alias publication
//!
//! The canonical config lives at `<root>/<uuid>/config`. Everything the
//! firmware may ask for (MAC-keyed names, grub `<mac>.conf`, `<ip>.conf`)
//! is a relative symlink to it. On every publish the alias set is
//! reconciled: missing links are created, wrong ones repointed and stale
//! links to this node's config in either root are removed.

use crate::context::NodeBootContext;
use crate::dhcp::DEFAULT_IPXE_SCRIPT_NAME;
use crate::error::{bounded, BootError, Result};
use crate::fsutil;
use crate::options::BootConfigParams;
use crate::paths::{link_target, normalize, PathResolver};
use crate::policy::BootPolicy;
use crate::provider::{DhcpProvider, DhcpProviderKind};
use crate::settings::Settings;
use minijinja::Environment;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PXE_CONFIG_TEMPLATE: &str = include_str!("../templates/pxe_config.template");
pub const PXE_GRUB_CONFIG_TEMPLATE: &str = include_str!("../templates/pxe_grub_config.template");
pub const IPXE_CONFIG_TEMPLATE: &str = include_str!("../templates/ipxe_config.template");
pub const IPXE_BOOT_SCRIPT_TEMPLATE: &str = include_str!("../templates/ipxe_boot_script.template");

/// Where a template comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootTemplate {
    File(PathBuf),
    Builtin {
        name: &'static str,
        source: &'static str,
    },
}

impl BootTemplate {
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            BootTemplate::File(path) => path.to_string_lossy(),
            BootTemplate::Builtin { name, .. } => Cow::Borrowed(*name),
        }
    }

    fn source(&self) -> Result<Cow<'static, str>> {
        match self {
            BootTemplate::File(path) => fs::read_to_string(path)
                .map(Cow::Owned)
                .map_err(BootError::fs(path)),
            BootTemplate::Builtin { source, .. } => Ok(Cow::Borrowed(*source)),
        }
    }

    fn builtin_or(path: &Option<PathBuf>, name: &'static str, source: &'static str) -> Self {
        match path {
            Some(path) => BootTemplate::File(path.clone()),
            None => BootTemplate::Builtin { name, source },
        }
    }
}

#[derive(Serialize)]
struct ConfigContext<'a> {
    pxe_options: &'a BootConfigParams,
    #[serde(rename = "ROOT")]
    root: &'a str,
    #[serde(rename = "DISK_IDENTIFIER")]
    disk_identifier: &'a str,
}

#[derive(Serialize)]
struct BootScriptContext<'a> {
    ipxe_for_mac_uri: &'a str,
}

/// Outcome of an alias reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasReport {
    /// Links created or repointed
    pub linked: Vec<PathBuf>,
    /// Stale links removed
    pub removed: Vec<PathBuf>,
}

/// Renders boot configs and publishes their aliases
#[derive(Debug, Clone)]
pub struct BootConfigRenderer {
    paths: PathResolver,
    dir_permission: Option<u32>,
    pxe_template: BootTemplate,
    grub_template: BootTemplate,
    ipxe_template: BootTemplate,
    boot_script_template: BootTemplate,
    boot_script_name: String,
    dhcp_timeout: Duration,
}

impl BootConfigRenderer {
    pub fn from_settings(settings: &Settings) -> Self {
        let boot_script_name = settings
            .pxe
            .ipxe_boot_script
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_IPXE_SCRIPT_NAME.to_string());
        Self {
            paths: PathResolver::from_settings(settings),
            dir_permission: settings.pxe.dir_permission,
            pxe_template: BootTemplate::builtin_or(
                &settings.pxe.pxe_config_template,
                "pxe_config.template",
                PXE_CONFIG_TEMPLATE,
            ),
            grub_template: BootTemplate::builtin_or(
                &settings.pxe.uefi_pxe_config_template,
                "pxe_grub_config.template",
                PXE_GRUB_CONFIG_TEMPLATE,
            ),
            ipxe_template: BootTemplate::builtin_or(
                &settings.pxe.ipxe_config_template,
                "ipxe_config.template",
                IPXE_CONFIG_TEMPLATE,
            ),
            boot_script_template: BootTemplate::builtin_or(
                &settings.pxe.ipxe_boot_script,
                "ipxe_boot_script.template",
                IPXE_BOOT_SCRIPT_TEMPLATE,
            ),
            boot_script_name,
            dhcp_timeout: settings.dhcp.timeout(),
        }
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Template for a node: the node's own override, else by boot policy
    pub fn template_for(&self, ctx: &NodeBootContext, policy: &BootPolicy) -> BootTemplate {
        if let Some(path) = &ctx.driver_info.pxe_template {
            return BootTemplate::File(PathBuf::from(path));
        }
        if policy.is_ipxe() {
            self.ipxe_template.clone()
        } else if policy.uses_grub() {
            self.grub_template.clone()
        } else {
            self.pxe_template.clone()
        }
    }

    /// Renders `template` with the policy's placeholder tokens
    pub fn render(
        &self,
        template: &BootTemplate,
        params: &BootConfigParams,
        policy: &BootPolicy,
    ) -> Result<String> {
        let placeholders = policy.placeholders();
        let source = template.source()?;
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        let rendered = env.render_str(
            &source,
            ConfigContext {
                pxe_options: params,
                root: placeholders.root,
                disk_identifier: placeholders.disk_identifier,
            },
        )?;
        Ok(rendered)
    }

    /// Creates the node and config directories when absent
    pub fn ensure_config_dirs(&self, ctx: &NodeBootContext, policy: &BootPolicy) -> Result<()> {
        fsutil::ensure_dir(&self.paths.node_dir(&ctx.uuid, policy.protocol), self.dir_permission)?;
        fsutil::ensure_dir(&self.paths.config_dir(policy.protocol), self.dir_permission)?;
        Ok(())
    }

    /// Renders the config, writes it to the canonical path and publishes its aliases
    pub async fn render_and_publish(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        params: &BootConfigParams,
        template: &BootTemplate,
        dhcp: &dyn DhcpProvider,
    ) -> Result<AliasReport> {
        debug!("Building boot config for node {} from {}", ctx.uuid, template.name());
        self.ensure_config_dirs(ctx, policy)?;

        let content = self.render(template, params, policy)?;
        let config = self.paths.config_path(&ctx.uuid, policy.protocol);
        fsutil::write_atomic(&config, content.as_bytes())?;

        self.publish_aliases(ctx, policy, dhcp).await
    }

    /// Publishes the node's aliases for an existing canonical config.
    ///
    /// MAC aliases are linked before the address lookup, so a failing lookup
    /// still leaves the node bootable by MAC.
    pub async fn publish_aliases(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        dhcp: &dyn DhcpProvider,
    ) -> Result<AliasReport> {
        let kind = dhcp.kind();
        let config = self.paths.config_path(&ctx.uuid, policy.protocol);
        let mut linked = Vec::new();
        let mac_aliases = self.desired_aliases(ctx, policy, &[], &kind)?;
        self.link_aliases(ctx, &config, &mac_aliases, &mut linked)?;

        let addresses = if policy.uses_grub() {
            self.alias_addresses(ctx, dhcp).await?
        } else {
            Vec::new()
        };
        let desired = self.desired_aliases(ctx, policy, &addresses, &kind)?;
        let mut report = self.reconcile_aliases(ctx, policy, &desired)?;
        linked.append(&mut report.linked);
        report.linked = linked;
        Ok(report)
    }

    /// IP addresses to publish `<ip>.conf` aliases for.
    ///
    /// Without DHCP management a missing answer only loses the IP aliases;
    /// any other backend is expected to know the node's leases.
    pub async fn alias_addresses(
        &self,
        ctx: &NodeBootContext,
        dhcp: &dyn DhcpProvider,
    ) -> Result<Vec<String>> {
        let kind = dhcp.kind();
        let lookup = bounded("DHCP address lookup", self.dhcp_timeout, dhcp.get_ip_addresses(ctx)).await;
        match (lookup, kind) {
            (Ok(Some(addresses)), _) if !addresses.is_empty() => Ok(addresses),
            (Ok(Some(_)), DhcpProviderKind::None) => {
                warn!("No IP addresses assigned for node {}", ctx.uuid);
                Ok(Vec::new())
            }
            (Ok(None), DhcpProviderKind::None) => {
                warn!(
                    "IP addresses of node {} unavailable: DHCP address management is not available",
                    ctx.uuid
                );
                Ok(Vec::new())
            }
            (Err(e), DhcpProviderKind::None) => {
                warn!("Could not get IP addresses for node {}: {}", ctx.uuid, e);
                Ok(Vec::new())
            }
            (Ok(_), kind) => Err(BootError::AddressLookupFailed {
                node: ctx.uuid.clone(),
                reason: format!("DHCP provider {} returned no addresses", kind.name()),
            }),
            (Err(e @ BootError::AddressLookupFailed { .. }), _) => Err(e),
            (Err(e), _) => Err(BootError::AddressLookupFailed {
                node: ctx.uuid.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// The full alias set of a node under `policy`
    pub fn desired_aliases(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        addresses: &[String],
        kind: &DhcpProviderKind,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut aliases = BTreeSet::new();
        for port in &ctx.ports {
            aliases.insert(self.paths.mac_path(
                &port.address,
                port.client_id.as_deref(),
                policy.protocol,
            ));
            aliases.insert(self.paths.grub_mac_path(&port.address, policy.protocol));
        }
        if policy.uses_grub() {
            for address in addresses {
                match self.paths.ip_path(address) {
                    Ok(path) => {
                        aliases.insert(path);
                    }
                    Err(e) if *kind == DhcpProviderKind::None => {
                        warn!("Skipping IP alias for node {}: {}", ctx.uuid, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(aliases)
    }

    /// Makes the node's aliases exactly `desired`
    pub fn reconcile_aliases(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        desired: &BTreeSet<PathBuf>,
    ) -> Result<AliasReport> {
        let config = self.paths.config_path(&ctx.uuid, policy.protocol);
        let mut report = AliasReport::default();
        self.link_aliases(ctx, &config, desired, &mut report.linked)?;

        for alias in self.existing_aliases(ctx) {
            if !desired.contains(&alias) {
                fsutil::unlink_without_raise(&alias);
                report.removed.push(alias);
            }
        }

        if !report.linked.is_empty() || !report.removed.is_empty() {
            info!(
                "Published boot config aliases for node {}: {} linked, {} stale removed",
                ctx.uuid,
                report.linked.len(),
                report.removed.len()
            );
        }
        Ok(report)
    }

    fn link_aliases(
        &self,
        ctx: &NodeBootContext,
        config: &Path,
        aliases: &BTreeSet<PathBuf>,
        linked: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for alias in aliases {
            if let Some(dir) = alias.parent() {
                fsutil::ensure_dir(dir, self.dir_permission)?;
            }
            if fsutil::symlink_atomic(&link_target(alias, config), alias)? {
                debug!("Linked {} to {} for node {}", alias.display(), config.display(), ctx.uuid);
                linked.push(alias.clone());
            }
        }
        Ok(())
    }

    /// Symlinks in either root that resolve to this node's canonical config
    pub fn existing_aliases(&self, ctx: &NodeBootContext) -> Vec<PathBuf> {
        let roots = self.paths.roots();
        let configs: Vec<PathBuf> = roots
            .iter()
            .map(|root| normalize(&root.join(&ctx.uuid).join(crate::paths::CONFIG_FILE_NAME)))
            .collect();

        let mut found = Vec::new();
        for root in roots {
            for dir in [root.to_path_buf(), root.join(self.paths.config_subdir())] {
                let Ok(entries) = fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let Ok(target) = fs::read_link(&path) else {
                        continue;
                    };
                    let resolved = normalize(&dir.join(target));
                    if configs.contains(&resolved) {
                        found.push(path);
                    }
                }
            }
        }
        found
    }

    /// Removes every alias of the node; never fails
    pub fn remove_aliases(&self, ctx: &NodeBootContext, policy: &BootPolicy, addresses: &[String]) {
        for port in &ctx.ports {
            fsutil::unlink_without_raise(&self.paths.mac_path(
                &port.address,
                port.client_id.as_deref(),
                policy.protocol,
            ));
            fsutil::unlink_without_raise(&self.paths.grub_mac_path(&port.address, policy.protocol));
        }
        for address in addresses {
            match self.paths.ip_path(address) {
                Ok(path) => fsutil::unlink_without_raise(&path),
                Err(e) => debug!("Ignoring address of node {}: {}", ctx.uuid, e),
            }
        }
        for alias in self.existing_aliases(ctx) {
            fsutil::unlink_without_raise(&alias);
        }
    }

    /// Writes the iPXE boot script into the HTTP root when its content changed.
    ///
    /// Returns whether the file was written.
    pub fn ensure_ipxe_boot_script(&self) -> Result<bool> {
        let for_mac_uri = format!("{}/", self.paths.config_subdir());
        let source = self.boot_script_template.source()?;
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        let content = env.render_str(
            &source,
            BootScriptContext {
                ipxe_for_mac_uri: &for_mac_uri,
            },
        )?;

        let path = self.boot_script_path();
        if fsutil::has_content(&path, content.as_bytes()) {
            return Ok(false);
        }
        fsutil::ensure_dir(self.paths.http_root(), self.dir_permission)?;
        fsutil::write_atomic(&path, content.as_bytes())?;
        info!("Wrote iPXE boot script {}", path.display());
        Ok(true)
    }

    pub fn boot_script_path(&self) -> PathBuf {
        self.paths.http_root().join(&self.boot_script_name)
    }
}

/// Whether the canonical config of a node exists
pub fn config_exists(paths: &PathResolver, ctx: &NodeBootContext, policy: &BootPolicy) -> bool {
    paths.config_path(&ctx.uuid, policy.protocol).is_file()
}

#[cfg(test)]
#[path = "render_test.rs"]
mod render_test;
