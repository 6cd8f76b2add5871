//! Boot artifact resolution
//!
//! Maps a node to the kernel/ramdisk images it boots and where each one
//! lives in the node directory.

use crate::context::NodeBootContext;
use crate::error::{bounded, BootError, Result};
use crate::paths::PathResolver;
use crate::policy::{BootPolicy, BootSource};
use crate::provider::NodeStore;
use crate::settings::ConductorSettings;
use image_service_client::ImageServiceTrait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

pub const DEPLOY_KERNEL: &str = "deploy_kernel";
pub const DEPLOY_RAMDISK: &str = "deploy_ramdisk";
pub const RESCUE_KERNEL: &str = "rescue_kernel";
pub const RESCUE_RAMDISK: &str = "rescue_ramdisk";
pub const KERNEL: &str = "kernel";
pub const RAMDISK: &str = "ramdisk";

/// Which agent ramdisk a node boots before its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamdiskMode {
    Deploy,
    Rescue,
}

impl RamdiskMode {
    /// Kernel and ramdisk labels of this mode
    pub fn labels(&self) -> (&'static str, &'static str) {
        match self {
            RamdiskMode::Deploy => (DEPLOY_KERNEL, DEPLOY_RAMDISK),
            RamdiskMode::Rescue => (RESCUE_KERNEL, RESCUE_RAMDISK),
        }
    }

    pub fn for_context(ctx: &NodeBootContext) -> Self {
        if ctx.provision_state.is_rescue() {
            RamdiskMode::Rescue
        } else {
            RamdiskMode::Deploy
        }
    }
}

/// One artifact: where it comes from and where the node reads it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub label: String,
    pub href: String,
    pub path: PathBuf,
}

/// Artifacts keyed by label
pub type ArtifactSet = BTreeMap<String, ImageReference>;

/// Resolves artifact references for nodes
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    paths: PathResolver,
    conductor: ConductorSettings,
    image_timeout: Duration,
}

impl ArtifactResolver {
    pub fn new(paths: PathResolver, conductor: ConductorSettings, image_timeout: Duration) -> Self {
        Self {
            paths,
            conductor,
            image_timeout,
        }
    }

    fn reference(&self, ctx: &NodeBootContext, label: &str, href: String) -> ImageReference {
        ImageReference {
            label: label.to_string(),
            href,
            path: self.paths.artifact_path(&ctx.uuid, label, ctx.protocol),
        }
    }

    /// Deploy or rescue kernel and ramdisk of a node.
    ///
    /// Node values win; the conductor defaults are used only when the node
    /// names neither image.
    pub fn boot_artifacts(&self, ctx: &NodeBootContext, mode: RamdiskMode) -> Result<ArtifactSet> {
        let (kernel_label, ramdisk_label) = mode.labels();
        let (node_kernel, node_ramdisk, conf_kernel, conf_ramdisk) = match mode {
            RamdiskMode::Deploy => (
                &ctx.driver_info.deploy_kernel,
                &ctx.driver_info.deploy_ramdisk,
                &self.conductor.deploy_kernel,
                &self.conductor.deploy_ramdisk,
            ),
            RamdiskMode::Rescue => (
                &ctx.driver_info.rescue_kernel,
                &ctx.driver_info.rescue_ramdisk,
                &self.conductor.rescue_kernel,
                &self.conductor.rescue_ramdisk,
            ),
        };

        let (kernel, ramdisk) = if node_kernel.is_none() && node_ramdisk.is_none() {
            (conf_kernel.clone(), conf_ramdisk.clone())
        } else {
            (node_kernel.clone(), node_ramdisk.clone())
        };

        let mut missing = Vec::new();
        if kernel.is_none() {
            missing.push(kernel_label);
        }
        if ramdisk.is_none() {
            missing.push(ramdisk_label);
        }
        let (Some(kernel), Some(ramdisk)) = (kernel, ramdisk) else {
            return Err(BootError::ArtifactMissing(format!(
                "node {} is missing {}",
                ctx.uuid,
                missing.join(", ")
            )));
        };

        let mut set = ArtifactSet::new();
        set.insert(kernel_label.to_string(), self.reference(ctx, kernel_label, kernel));
        set.insert(ramdisk_label.to_string(), self.reference(ctx, ramdisk_label, ramdisk));
        Ok(set)
    }

    /// Instance kernel and ramdisk of a netbooted partition image or ramdisk instance.
    ///
    /// References missing from the node are read from the image's
    /// `kernel_id`/`ramdisk_id` properties and recorded back on the node.
    pub async fn instance_artifacts(
        &self,
        ctx: &NodeBootContext,
        policy: &BootPolicy,
        images: &dyn ImageServiceTrait,
        nodes: &dyn NodeStore,
    ) -> Result<ArtifactSet> {
        if !matches!(
            policy.source,
            BootSource::Image { whole_disk: false } | BootSource::Ramdisk
        ) {
            return Ok(ArtifactSet::new());
        }

        let info = &ctx.instance_info;
        let (kernel, ramdisk) = match (&info.kernel, &info.ramdisk) {
            (Some(kernel), Some(ramdisk)) => (kernel.clone(), ramdisk.clone()),
            _ => {
                let Some(source) = info.image_source.as_deref() else {
                    return Err(BootError::ArtifactMissing(format!(
                        "node {} has no instance kernel/ramdisk and no image_source",
                        ctx.uuid
                    )));
                };
                debug!("Looking up kernel and ramdisk of image {} for node {}", source, ctx.uuid);
                let image = bounded("image metadata lookup", self.image_timeout, async {
                    images.show(source).await.map_err(BootError::from)
                })
                .await?;
                let kernel = info.kernel.clone().or_else(|| image.property_str("kernel_id"));
                let ramdisk = info.ramdisk.clone().or_else(|| image.property_str("ramdisk_id"));
                let (Some(kernel), Some(ramdisk)) = (kernel, ramdisk) else {
                    return Err(BootError::ArtifactMissing(format!(
                        "image {} of node {} has no kernel_id/ramdisk_id",
                        source, ctx.uuid
                    )));
                };
                nodes.save_instance_images(&ctx.uuid, &kernel, &ramdisk).await?;
                info!(
                    "Resolved instance kernel {} and ramdisk {} for node {}",
                    kernel, ramdisk, ctx.uuid
                );
                (kernel, ramdisk)
            }
        };

        let mut set = ArtifactSet::new();
        set.insert(KERNEL.to_string(), self.reference(ctx, KERNEL, kernel));
        set.insert(RAMDISK.to_string(), self.reference(ctx, RAMDISK, ramdisk));
        Ok(set)
    }

    /// Every artifact location a node may own, used on clean-up
    pub fn all_artifact_paths(&self, ctx: &NodeBootContext) -> Vec<PathBuf> {
        [KERNEL, RAMDISK, DEPLOY_KERNEL, DEPLOY_RAMDISK, RESCUE_KERNEL, RESCUE_RAMDISK]
            .iter()
            .map(|label| self.paths.artifact_path(&ctx.uuid, label, ctx.protocol))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryNodeStore;
    use image_service_client::{ImageMetadata, MockImageService};

    const IMAGE: &str = "4b0e0a2c-0a45-4f3c-8ab1-3b1d5b61f3e1";

    fn resolver(conductor: ConductorSettings) -> ArtifactResolver {
        ArtifactResolver::new(
            PathResolver::new("/tftpboot", "/httpboot"),
            conductor,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_deploy_artifacts_from_node() {
        let mut ctx = NodeBootContext::new("n1");
        ctx.driver_info.deploy_kernel = Some("glance://dk".to_string());
        ctx.driver_info.deploy_ramdisk = Some("glance://dr".to_string());
        let set = resolver(ConductorSettings::default())
            .boot_artifacts(&ctx, RamdiskMode::Deploy)
            .unwrap();
        assert_eq!(set[DEPLOY_KERNEL].href, "glance://dk");
        assert_eq!(set[DEPLOY_KERNEL].path, PathBuf::from("/tftpboot/n1/deploy_kernel"));
        assert_eq!(set[DEPLOY_RAMDISK].path, PathBuf::from("/tftpboot/n1/deploy_ramdisk"));
    }

    #[test]
    fn test_conductor_fallback_only_when_node_has_none() {
        let conductor = ConductorSettings {
            rescue_kernel: Some("http://images/rk".to_string()),
            rescue_ramdisk: Some("http://images/rr".to_string()),
            ..Default::default()
        };
        let ctx = NodeBootContext::new("n1");
        let set = resolver(conductor.clone())
            .boot_artifacts(&ctx, RamdiskMode::Rescue)
            .unwrap();
        assert_eq!(set[RESCUE_KERNEL].href, "http://images/rk");

        let mut partial = NodeBootContext::new("n1");
        partial.driver_info.rescue_kernel = Some("http://node/rk".to_string());
        let err = resolver(conductor)
            .boot_artifacts(&partial, RamdiskMode::Rescue)
            .unwrap_err();
        match err {
            BootError::ArtifactMissing(msg) => assert!(msg.contains(RESCUE_RAMDISK)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_instance_artifacts_from_image_properties() {
        let images = MockImageService::new("http://glance");
        images.add_image(
            ImageMetadata::new(IMAGE)
                .with_property("kernel_id", "k-1")
                .with_property("ramdisk_id", "r-1"),
        );
        let nodes = MemoryNodeStore::default();
        let mut ctx = NodeBootContext::new("n1");
        ctx.instance_info.image_source = Some(IMAGE.to_string());
        let policy = BootPolicy::resolve(&ctx).unwrap();

        let set = resolver(ConductorSettings::default())
            .instance_artifacts(&ctx, &policy, &images, &nodes)
            .await
            .unwrap();
        assert_eq!(set[KERNEL].href, "k-1");
        assert_eq!(set[RAMDISK].href, "r-1");
        assert_eq!(
            nodes.saved("n1"),
            Some(("k-1".to_string(), "r-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_instance_artifacts_empty_for_whole_disk() {
        let images = MockImageService::new("http://glance");
        let nodes = MemoryNodeStore::default();
        let mut ctx = NodeBootContext::new("n1");
        ctx.is_whole_disk_image = true;
        let policy = BootPolicy::resolve(&ctx).unwrap();
        let set = resolver(ConductorSettings::default())
            .instance_artifacts(&ctx, &policy, &images, &nodes)
            .await
            .unwrap();
        assert!(set.is_empty());
        assert_eq!(nodes.saved("n1"), None);
    }

    #[tokio::test]
    async fn test_instance_artifacts_missing_properties() {
        let images = MockImageService::new("http://glance");
        images.add_image(ImageMetadata::new(IMAGE).with_property("kernel_id", "k-1"));
        let nodes = MemoryNodeStore::default();
        let mut ctx = NodeBootContext::new("n1");
        ctx.instance_info.image_source = Some(IMAGE.to_string());
        let policy = BootPolicy::resolve(&ctx).unwrap();
        let err = resolver(ConductorSettings::default())
            .instance_artifacts(&ctx, &policy, &images, &nodes)
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::ArtifactMissing(_)));
    }
}
