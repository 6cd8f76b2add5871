//! Boot orchestration
//!
//! Public entry points of the engine. Each call sequences DHCP option
//! pushes, artifact caching, config rendering and alias publication for one
//! node. Callers serialize operations per node; different nodes may be
//! prepared concurrently against the same orchestrator.

use crate::artifacts::{ArtifactResolver, ArtifactSet, ImageReference, RamdiskMode};
use crate::context::{NodeBootContext, ProvisionState};
use crate::dhcp::{DhcpOptionBuilder, IpVersion};
use crate::error::{bounded, BootError, Result};
use crate::fsutil;
use crate::image_cache::ImageCache;
use crate::options::{BootConfigParams, ParamsBuilder};
use crate::paths::PathResolver;
use crate::policy::{BootPolicy, BootSource};
use crate::provider::{DhcpProvider, ImageConverter, NodeStore};
use crate::render::{config_exists, AliasReport, BootConfigRenderer, BootTemplate};
use crate::service_mode;
use crate::settings::Settings;
use image_service_client::ImageServiceTrait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Device the node should boot from next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Pxe,
    Disk,
}

/// How far a boot preparation got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Unprepared,
    DhcpConfigured,
    ConfigWritten,
    AliasesPublished,
    ServiceMode,
    CleanedUp,
}

/// Result of a boot preparation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOutcome {
    /// `None` when the caller must leave the boot device alone
    pub boot_device: Option<BootDevice>,
    pub stage: BootStage,
}

/// Services the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub dhcp: Arc<dyn DhcpProvider>,
    pub images: Arc<dyn ImageServiceTrait>,
    pub nodes: Arc<dyn NodeStore>,
    pub converter: Arc<dyn ImageConverter>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("dhcp", &self.dhcp.kind())
            .field("images", &self.images.base_url())
            .finish_non_exhaustive()
    }
}

/// Network boot orchestrator
#[derive(Debug)]
pub struct BootOrchestrator {
    paths: PathResolver,
    dhcp_options: DhcpOptionBuilder,
    renderer: BootConfigRenderer,
    params: ParamsBuilder,
    artifacts: ArtifactResolver,
    cache: Arc<ImageCache>,
    collaborators: Collaborators,
    ip_versions: [IpVersion; 2],
    url_boot: bool,
    dhcp_timeout: Duration,
}

impl BootOrchestrator {
    /// Validates `settings` and wires the components
    pub fn new(settings: &Settings, collaborators: Collaborators) -> Result<Self> {
        settings.validate()?;
        let paths = PathResolver::from_settings(settings);
        let cache = Arc::new(ImageCache::new(
            settings,
            collaborators.images.clone(),
            collaborators.converter.clone(),
        ));
        let ip_versions = match settings.pxe.ip_version {
            IpVersion::V4 => [IpVersion::V4, IpVersion::V6],
            IpVersion::V6 => [IpVersion::V6, IpVersion::V4],
        };
        Ok(Self {
            artifacts: ArtifactResolver::new(
                paths.clone(),
                settings.conductor.clone(),
                settings.image_service.timeout(),
            ),
            paths,
            dhcp_options: DhcpOptionBuilder::from_settings(settings),
            renderer: BootConfigRenderer::from_settings(settings),
            params: ParamsBuilder::from_settings(settings),
            cache,
            collaborators,
            ip_versions,
            url_boot: settings.pxe.url_boot,
            dhcp_timeout: settings.dhcp.timeout(),
        })
    }

    /// Shares an existing image cache, e.g. with the janitor
    pub fn with_image_cache(mut self, cache: Arc<ImageCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn image_cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn renderer(&self) -> &BootConfigRenderer {
        &self.renderer
    }

    /// Deploy or rescue kernel/ramdisk references and their node-local paths
    pub fn get_boot_artifact_paths(&self, ctx: &NodeBootContext, mode: RamdiskMode) -> Result<ArtifactSet> {
        self.artifacts.boot_artifacts(ctx, mode)
    }

    /// Pushes the boot options of both IP versions in one update.
    ///
    /// The backend replaces the node's options on every update, so the
    /// configured version goes first and both are sent together. Each option
    /// carries its version and the backend applies the versions separately.
    pub async fn configure_dhcp(&self, ctx: &NodeBootContext) -> Result<()> {
        let dhcp = &self.collaborators.dhcp;
        let capabilities = dhcp.capabilities();
        let mut options = Vec::new();
        for version in self.ip_versions {
            let built = self
                .dhcp_options
                .build(ctx, ctx.protocol, self.url_boot, version, capabilities);
            debug!("Built {} IPv{} DHCP options for node {}", built.len(), version, ctx.uuid);
            options.extend(built);
        }

        bounded("DHCP update", self.dhcp_timeout, dhcp.update_dhcp(ctx, &options))
            .await
            .map_err(|e| match e {
                BootError::DhcpUpdateFailed(_) => e,
                other => BootError::DhcpUpdateFailed(format!("node {}: {}", ctx.uuid, other)),
            })?;
        info!("Pushed {} DHCP options for node {}", options.len(), ctx.uuid);
        Ok(())
    }

    /// Renders `params` into the node's canonical config and publishes its aliases.
    ///
    /// `template` defaults to the node's override or the template matching
    /// its boot policy.
    pub async fn create_boot_config(
        &self,
        ctx: &NodeBootContext,
        params: &BootConfigParams,
        template: Option<&BootTemplate>,
    ) -> Result<AliasReport> {
        let policy = BootPolicy::resolve(ctx)?;
        let template = match template {
            Some(template) => template.clone(),
            None => self.renderer.template_for(ctx, &policy),
        };
        let report = self
            .renderer
            .render_and_publish(ctx, &policy, params, &template, self.collaborators.dhcp.as_ref())
            .await?;
        info!("Created boot config for node {} from {}", ctx.uuid, template.name());
        Ok(report)
    }

    /// Edits the node's config in place to boot the deployed instance
    pub fn switch_to_service_mode(&self, ctx: &NodeBootContext, root_identifier: Option<&str>) -> Result<()> {
        let policy = BootPolicy::resolve(ctx)?;
        let config = self.paths.config_path(&ctx.uuid, policy.protocol);
        service_mode::switch_config(&config, root_identifier, &policy)
    }

    /// Prepares a node to boot its deployed instance
    pub async fn prepare_instance_boot(&self, ctx: &NodeBootContext) -> Result<PrepareOutcome> {
        let policy = BootPolicy::resolve(ctx)?;

        let (boot_device, stage) = match policy.source {
            BootSource::Ramdisk | BootSource::Volume => {
                let artifacts = self.instance_artifacts(ctx, &policy).await?;
                self.cache_artifacts(ctx, &policy, &artifacts).await?;
                self.configure_dhcp(ctx).await?;
                if config_exists(&self.paths, ctx, &policy) {
                    self.publish_aliases(ctx, &policy).await?;
                } else {
                    let params = self.params.build(
                        ctx,
                        &policy,
                        &artifacts,
                        RamdiskMode::Deploy,
                        true,
                        &BTreeMap::new(),
                    )?;
                    self.create_boot_config(ctx, &params, None).await?;
                }
                self.switch_to_service_mode(ctx, None)?;
                (Some(BootDevice::Pxe), BootStage::ServiceMode)
            }
            BootSource::Image { whole_disk } => {
                let artifacts = self.instance_artifacts(ctx, &policy).await?;
                self.cache_artifacts(ctx, &policy, &artifacts).await?;
                self.configure_dhcp(ctx).await?;

                match ctx.root_uuid_or_disk_id.as_deref() {
                    Some(root) => {
                        self.build_service_config(ctx, &policy, &artifacts, root).await?;
                        (Some(BootDevice::Pxe), BootStage::ServiceMode)
                    }
                    None if whole_disk => {
                        warn!(
                            "Disk identifier of node {} is unknown, booting the instance from disk",
                            ctx.uuid
                        );
                        self.clean_up_config(ctx, &policy).await;
                        (Some(BootDevice::Disk), BootStage::CleanedUp)
                    }
                    None => {
                        warn!(
                            "Root partition UUID of node {} is unknown, unable to switch its boot config to service mode",
                            ctx.uuid
                        );
                        (None, BootStage::DhcpConfigured)
                    }
                }
            }
            BootSource::Local => {
                self.clean_up_config(ctx, &policy).await;
                (Some(BootDevice::Disk), BootStage::CleanedUp)
            }
        };

        if boot_device == Some(BootDevice::Pxe) && policy.is_ipxe() {
            self.renderer.ensure_ipxe_boot_script()?;
        }

        // Active nodes keep their current boot device
        let boot_device = if ctx.provision_state == ProvisionState::Active {
            None
        } else {
            boot_device
        };
        info!(
            "Prepared instance boot for node {}: {:?}, boot device {:?}",
            ctx.uuid, stage, boot_device
        );
        Ok(PrepareOutcome { boot_device, stage })
    }

    /// Prepares a node to boot the deploy or rescue ramdisk
    pub async fn prepare_ramdisk_boot(
        &self,
        ctx: &NodeBootContext,
        mode: RamdiskMode,
        ramdisk_params: &BTreeMap<String, String>,
    ) -> Result<PrepareOutcome> {
        let policy = BootPolicy::resolve(ctx)?;
        if policy.is_ipxe() {
            self.renderer.ensure_ipxe_boot_script()?;
        }
        self.configure_dhcp(ctx).await?;

        let mut artifacts = self.artifacts.boot_artifacts(ctx, mode)?;
        if mode == RamdiskMode::Deploy {
            artifacts.extend(self.instance_artifacts(ctx, &policy).await?);
        }

        let params = self.params.build(ctx, &policy, &artifacts, mode, false, ramdisk_params)?;
        self.create_boot_config(ctx, &params, None).await?;
        self.cache_artifacts(ctx, &policy, &artifacts).await?;

        info!("Prepared {:?} ramdisk boot for node {}", mode, ctx.uuid);
        Ok(PrepareOutcome {
            boot_device: Some(BootDevice::Pxe),
            stage: BootStage::AliasesPublished,
        })
    }

    /// Removes the ramdisk artifacts and the node's boot config
    pub async fn clean_up_ramdisk(&self, ctx: &NodeBootContext, mode: RamdiskMode) -> Result<()> {
        match self.artifacts.boot_artifacts(ctx, mode) {
            Ok(artifacts) => {
                for reference in artifacts.values() {
                    fsutil::unlink_without_raise(&reference.path);
                }
            }
            Err(e) => debug!("No {:?} artifacts to remove for node {}: {}", mode, ctx.uuid, e),
        }
        self.clean_up(ctx).await
    }

    /// Removes every boot file of the node and sweeps the image cache.
    ///
    /// Never fails: it runs on rollback paths and on nodes in any state.
    pub async fn clean_up(&self, ctx: &NodeBootContext) -> Result<()> {
        let policy = BootPolicy::from_context(ctx);
        for path in self.artifacts.all_artifact_paths(ctx) {
            fsutil::unlink_without_raise(&path);
        }
        self.clean_up_config(ctx, &policy).await;

        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.clean_up(None)).await {
            Ok(Ok(report)) if !report.evicted.is_empty() => debug!(
                "Image cache sweep after cleaning node {} evicted {:?}",
                ctx.uuid, report.evicted
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Image cache sweep failed while cleaning node {}: {}", ctx.uuid, e),
            Err(e) => error!("Image cache sweep task for node {} did not finish: {}", ctx.uuid, e),
        }
        Ok(())
    }

    async fn clean_up_config(&self, ctx: &NodeBootContext, policy: &BootPolicy) {
        debug!("Cleaning up boot config for node {}", ctx.uuid);
        let addresses = if policy.uses_grub() {
            let lookup = bounded(
                "DHCP address lookup",
                self.dhcp_timeout,
                self.collaborators.dhcp.get_ip_addresses(ctx),
            )
            .await;
            match lookup {
                Ok(addresses) => addresses.unwrap_or_default(),
                Err(e) => {
                    warn!("Could not get IP addresses of node {} for clean up: {}", ctx.uuid, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        self.renderer.remove_aliases(ctx, policy, &addresses);
        for root in self.paths.roots() {
            fsutil::rmtree_without_raise(&root.join(&ctx.uuid));
        }
    }

    /// Re-links the aliases of an existing config, which a failed earlier run may have missed
    async fn publish_aliases(&self, ctx: &NodeBootContext, policy: &BootPolicy) -> Result<()> {
        let report = self
            .renderer
            .publish_aliases(ctx, policy, self.collaborators.dhcp.as_ref())
            .await?;
        if !report.linked.is_empty() {
            info!("Restored {} boot config aliases for node {}", report.linked.len(), ctx.uuid);
        }
        Ok(())
    }

    async fn instance_artifacts(&self, ctx: &NodeBootContext, policy: &BootPolicy) -> Result<ArtifactSet> {
        self.artifacts
            .instance_artifacts(
                ctx,
                policy,
                self.collaborators.images.as_ref(),
                self.collaborators.nodes.as_ref(),
            )
            .await
    }

    async fn cache_artifacts(&self, ctx: &NodeBootContext, policy: &BootPolicy, artifacts: &ArtifactSet) -> Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }
        self.renderer.ensure_config_dirs(ctx, policy)?;
        let references: Vec<ImageReference> = artifacts.values().cloned().collect();
        debug!("Fetching {} boot images for node {}", references.len(), ctx.uuid);
        self.cache.fetch_all(&references).await
    }

    /// Recreates a missing config for nodes that must be bootable right away, then switches it
    async fn build_service_config(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        artifacts: &ArtifactSet,
        root: &str,
    ) -> Result<()> {
        if config_exists(&self.paths, ctx, policy) {
            self.publish_aliases(ctx, policy).await?;
        } else if ctx.provision_state.rebuilds_missing_config() {
            info!("Boot config of node {} is missing, rebuilding it", ctx.uuid);
            let params = self.params.build(
                ctx,
                policy,
                artifacts,
                RamdiskMode::Deploy,
                true,
                &BTreeMap::new(),
            )?;
            self.create_boot_config(ctx, &params, None).await?;
        }
        self.switch_to_service_mode(ctx, Some(root))
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_test;
