//! Unit tests for the boot orchestrator

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::context::{BootMode, BootOption, ProtocolMode};
    use crate::dhcp::DhcpOptionCode;
    use crate::provider::DhcpProviderKind;
    use crate::testing::{test_settings, CopyConverter, MemoryNodeStore, RecordingDhcpProvider};
    use image_service_client::{ImageMetadata, MockImageService};
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};

    const DEPLOY_KERNEL_ID: &str = "0d4b7f3e-5a1c-4e2b-9f6d-7c8a9b0e1f21";
    const DEPLOY_RAMDISK_ID: &str = "0d4b7f3e-5a1c-4e2b-9f6d-7c8a9b0e1f22";
    const IMAGE_ID: &str = "6a1f0c3b-2d4e-4f5a-8b9c-0d1e2f3a4b50";
    const KERNEL_ID: &str = "6a1f0c3b-2d4e-4f5a-8b9c-0d1e2f3a4b51";
    const RAMDISK_ID: &str = "6a1f0c3b-2d4e-4f5a-8b9c-0d1e2f3a4b52";
    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    struct Harness {
        _dir: tempfile::TempDir,
        tftp: PathBuf,
        http: PathBuf,
        dhcp: Arc<RecordingDhcpProvider>,
        images: MockImageService,
        nodes: Arc<MemoryNodeStore>,
        orchestrator: BootOrchestrator,
    }

    fn harness() -> Harness {
        harness_with(RecordingDhcpProvider::new(DhcpProviderKind::None))
    }

    fn harness_with(dhcp: RecordingDhcpProvider) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let images = MockImageService::new("http://images.test");
        for (id, content) in [
            (DEPLOY_KERNEL_ID, "deploy kernel"),
            (DEPLOY_RAMDISK_ID, "deploy ramdisk"),
            (KERNEL_ID, "instance kernel"),
            (RAMDISK_ID, "instance ramdisk"),
        ] {
            images.add_image(ImageMetadata::new(id));
            images.add_content(id, content.as_bytes().to_vec());
        }
        images.add_image(
            ImageMetadata::new(IMAGE_ID)
                .with_property("kernel_id", KERNEL_ID)
                .with_property("ramdisk_id", RAMDISK_ID),
        );

        let dhcp = Arc::new(dhcp);
        let nodes = Arc::new(MemoryNodeStore::default());
        let orchestrator = BootOrchestrator::new(
            &settings,
            Collaborators {
                dhcp: dhcp.clone(),
                images: Arc::new(images.clone()),
                nodes: nodes.clone(),
                converter: Arc::new(CopyConverter::default()),
            },
        )
        .unwrap();

        Harness {
            tftp: settings.pxe.tftp_root.clone(),
            http: settings.deploy.http_root.clone(),
            _dir: dir,
            dhcp,
            images,
            nodes,
            orchestrator,
        }
    }

    fn node() -> NodeBootContext {
        let mut ctx = NodeBootContext::new("n1").with_port(MAC).unwrap();
        ctx.driver_info.deploy_kernel = Some(DEPLOY_KERNEL_ID.to_string());
        ctx.driver_info.deploy_ramdisk = Some(DEPLOY_RAMDISK_ID.to_string());
        ctx.instance_info.image_source = Some(IMAGE_ID.to_string());
        ctx
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    fn exists(path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    #[tokio::test]
    async fn test_prepare_deploy_ramdisk_on_bios_pxe() {
        let h = harness();
        let ctx = node();

        let outcome = h
            .orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.boot_device, Some(BootDevice::Pxe));
        assert_eq!(outcome.stage, BootStage::AliasesPublished);

        let config = read(&h.tftp.join("n1/config"));
        assert!(config.starts_with("default deploy\n"));
        assert!(config.contains("kernel n1/deploy_kernel"));
        assert!(config.contains("kernel n1/kernel"));
        assert!(config.contains("root={{ ROOT }}"));

        let alias = h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff");
        assert_eq!(fs::read_link(&alias).unwrap(), Path::new("../n1/config"));

        assert_eq!(read(&h.tftp.join("n1/deploy_kernel")), "deploy kernel");
        assert_eq!(read(&h.tftp.join("n1/ramdisk")), "instance ramdisk");
        assert_eq!(
            h.nodes.saved("n1"),
            Some((KERNEL_ID.to_string(), RAMDISK_ID.to_string()))
        );

        let updates = h.dhcp.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].first().map(|o| o.ip_version), Some(IpVersion::V4));
        assert_eq!(updates[0].last().map(|o| o.ip_version), Some(IpVersion::V6));
    }

    #[tokio::test]
    async fn test_prepare_rescue_ramdisk_skips_instance_images() {
        let h = harness();
        let mut ctx = node();
        ctx.driver_info.rescue_kernel = Some(DEPLOY_KERNEL_ID.to_string());
        ctx.driver_info.rescue_ramdisk = Some(DEPLOY_RAMDISK_ID.to_string());

        let mut ramdisk_params = BTreeMap::new();
        ramdisk_params.insert("rescue_password".to_string(), "hash".to_string());
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Rescue, &ramdisk_params)
            .await
            .unwrap();

        let config = read(&h.tftp.join("n1/config"));
        assert!(config.contains("kernel n1/rescue_kernel"));
        assert!(config.contains("rescue_password=hash"));
        assert!(config.contains("kernel no_kernel"));
        assert!(!exists(&h.tftp.join("n1/kernel")));
        assert_eq!(h.nodes.saved("n1"), None);
    }

    #[tokio::test]
    async fn test_missing_deploy_images_abort_preparation() {
        let h = harness();
        let mut ctx = node();
        ctx.driver_info.deploy_ramdisk = None;

        let err = h
            .orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BootError::ArtifactMissing(_)));
        assert!(!exists(&h.tftp.join("n1/config")));
    }

    #[tokio::test]
    async fn test_download_failure_aborts_without_retry() {
        let h = harness();
        h.images.fail_downloads(DEPLOY_KERNEL_ID);

        let err = h
            .orchestrator
            .prepare_ramdisk_boot(&node(), RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BootError::ImageDownloadFailed { .. }));
        assert_eq!(h.images.download_count(DEPLOY_KERNEL_ID), 1);
    }

    #[tokio::test]
    async fn test_prepare_ramdisk_on_ipxe_uses_http_root() {
        let h = harness();
        let ctx = node().with_protocol(ProtocolMode::Ipxe);

        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        assert!(h.http.join("boot.ipxe").is_file());
        let config = read(&h.http.join("n1/config"));
        assert!(config.starts_with("#!ipxe"));
        assert!(config.contains("http://192.0.2.1:8080/n1/deploy_kernel"));
        assert!(config.contains("initrd=deploy_ramdisk"));
        assert_eq!(
            fs::read_link(h.http.join("pxelinux.cfg/aa-bb-cc-dd-ee-ff")).unwrap(),
            Path::new("../n1/config")
        );
        assert_eq!(read(&h.http.join("n1/deploy_ramdisk")), "deploy ramdisk");
        assert!(!exists(&h.tftp.join("n1/config")));
    }

    #[tokio::test]
    async fn test_uefi_grub_publishes_ip_alias_and_cleans_it_up() {
        let h = harness_with(
            RecordingDhcpProvider::new(DhcpProviderKind::Neutron).with_addresses(&["10.0.0.5"]),
        );
        let ctx = node().with_boot_mode(BootMode::Uefi);

        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        let ip_alias = h.tftp.join("10.0.0.5.conf");
        assert_eq!(fs::read_link(&ip_alias).unwrap(), Path::new("n1/config"));
        assert!(read(&h.tftp.join("n1/config")).contains("root=(( ROOT ))"));

        h.orchestrator.clean_up(&ctx).await.unwrap();
        assert!(!exists(&ip_alias));
        assert!(!exists(&h.tftp.join("aa:bb:cc:dd:ee:ff.conf")));
    }

    #[tokio::test]
    async fn test_partition_instance_switches_to_service_mode() {
        let h = harness();
        let mut ctx = node();
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        ctx.provision_state = ProvisionState::DeployWait;
        ctx.root_uuid_or_disk_id = Some("4f2c9a1e-root".to_string());
        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.boot_device, Some(BootDevice::Pxe));
        assert_eq!(outcome.stage, BootStage::ServiceMode);
        let config = read(&h.tftp.join("n1/config"));
        assert!(config.starts_with("default boot_partition\n"));
        assert!(config.contains("root=UUID=4f2c9a1e-root ro"));
        // deploy section is still there, only the default moved
        assert!(config.contains("kernel n1/deploy_kernel"));
    }

    #[tokio::test]
    async fn test_active_node_rebuilds_missing_config() {
        let h = harness();
        let mut ctx = node();
        ctx.provision_state = ProvisionState::Active;
        ctx.root_uuid_or_disk_id = Some("4f2c9a1e-root".to_string());

        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.boot_device, None);
        assert_eq!(outcome.stage, BootStage::ServiceMode);
        let config = read(&h.tftp.join("n1/config"));
        assert!(config.starts_with("default boot_partition\n"));
        assert!(config.contains("kernel n1/kernel"));
        assert!(!config.contains("n1/deploy_kernel"));
        assert!(exists(&h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff")));
        assert_eq!(read(&h.tftp.join("n1/kernel")), "instance kernel");
    }

    #[tokio::test]
    async fn test_missing_config_not_rebuilt_outside_rebuild_states() {
        let h = harness();
        let mut ctx = node();
        ctx.provision_state = ProvisionState::DeployWait;
        ctx.root_uuid_or_disk_id = Some("4f2c9a1e-root".to_string());

        let err = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap_err();
        assert!(matches!(err, BootError::Filesystem { .. }));
    }

    #[tokio::test]
    async fn test_partition_without_root_uuid_keeps_deploy_config() {
        let h = harness();
        let ctx = node();
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.boot_device, None);
        assert_eq!(outcome.stage, BootStage::DhcpConfigured);
        assert!(read(&h.tftp.join("n1/config")).starts_with("default deploy\n"));
    }

    #[tokio::test]
    async fn test_whole_disk_without_identifier_boots_from_disk() {
        let h = harness();
        let mut ctx = node();
        ctx.is_whole_disk_image = true;
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.boot_device, Some(BootDevice::Disk));
        assert_eq!(outcome.stage, BootStage::CleanedUp);
        assert!(!exists(&h.tftp.join("n1")));
        assert!(!exists(&h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff")));
    }

    #[tokio::test]
    async fn test_whole_disk_with_identifier() {
        let h = harness();
        let mut ctx = node();
        ctx.is_whole_disk_image = true;
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        ctx.provision_state = ProvisionState::Deploying;
        ctx.root_uuid_or_disk_id = Some("0x9e1a3f07".to_string());
        h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        let config = read(&h.tftp.join("n1/config"));
        assert!(config.starts_with("default boot_whole_disk\n"));
        assert!(config.contains("append mbr:0x9e1a3f07"));
    }

    #[tokio::test]
    async fn test_local_boot_cleans_up_config() {
        let h = harness();
        let mut ctx = node();
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();

        ctx.boot_option = BootOption::Local;
        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.boot_device, Some(BootDevice::Disk));
        assert!(!exists(&h.tftp.join("n1/config")));
        assert!(!exists(&h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff")));
    }

    #[tokio::test]
    async fn test_ramdisk_instance_boots_ramdisk_section() {
        let h = harness();
        let mut ctx = node();
        ctx.boot_option = BootOption::Ramdisk;
        ctx.instance_info.kernel = Some(KERNEL_ID.to_string());
        ctx.instance_info.ramdisk = Some(RAMDISK_ID.to_string());
        ctx.instance_info.ramdisk_kernel_arguments = Some("console=ttyS0".to_string());

        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.boot_device, Some(BootDevice::Pxe));
        let config = read(&h.tftp.join("n1/config"));
        assert!(config.starts_with("default boot_ramdisk\n"));
        assert!(config.contains("root=/dev/ram0 text console=ttyS0"));
        assert_eq!(read(&h.tftp.join("n1/kernel")), "instance kernel");
        assert_eq!(h.nodes.saved("n1"), None);
    }

    #[tokio::test]
    async fn test_existing_config_without_aliases_gets_relinked() {
        let h = harness();
        let mut ctx = node();
        ctx.boot_option = BootOption::Ramdisk;
        ctx.instance_info.kernel = Some(KERNEL_ID.to_string());
        ctx.instance_info.ramdisk = Some(RAMDISK_ID.to_string());
        // config left behind by a run that stopped before publishing aliases
        fs::create_dir_all(h.tftp.join("n1")).unwrap();
        fs::write(
            h.tftp.join("n1/config"),
            "default deploy\n\nlabel deploy\nkernel n1/deploy_kernel\n\nlabel boot_ramdisk\nkernel n1/kernel\n",
        )
        .unwrap();

        let outcome = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(outcome.stage, BootStage::ServiceMode);
        let alias = h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff");
        assert_eq!(fs::read_link(&alias).unwrap(), Path::new("../n1/config"));
        assert!(read(&alias).starts_with("default boot_ramdisk\n"));
    }

    #[tokio::test]
    async fn test_service_mode_relinks_aliases_of_partition_config() {
        let h = harness();
        let mut ctx = node();
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();
        let alias = h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff");
        fs::remove_file(&alias).unwrap();

        ctx.provision_state = ProvisionState::DeployWait;
        ctx.root_uuid_or_disk_id = Some("d3adb33f-0000-4000-8000-00000000beef".to_string());
        h.orchestrator.prepare_instance_boot(&ctx).await.unwrap();

        assert_eq!(fs::read_link(&alias).unwrap(), Path::new("../n1/config"));
        assert!(read(&alias).starts_with("default boot_partition\n"));
    }

    #[tokio::test]
    async fn test_trusted_boot_rejected_on_uefi() {
        let h = harness();
        let mut ctx = node().with_boot_mode(BootMode::Uefi);
        ctx.trusted_boot = true;

        let err = h.orchestrator.prepare_instance_boot(&ctx).await.unwrap_err();
        assert!(matches!(err, BootError::InvalidParameter(_)));
        assert!(h.dhcp.updates().is_empty());
    }

    #[tokio::test]
    async fn test_dhcp_keeps_both_versions_after_update() {
        let h = harness();
        let ctx = node();

        h.orchestrator.configure_dhcp(&ctx).await.unwrap();
        h.orchestrator.configure_dhcp(&ctx).await.unwrap();

        let v4 = h.dhcp.options_for("n1", IpVersion::V4);
        let v6 = h.dhcp.options_for("n1", IpVersion::V6);
        for code in [
            DhcpOptionCode::BootfileName,
            DhcpOptionCode::PathPrefix,
            DhcpOptionCode::TftpServerName,
            DhcpOptionCode::TftpServerAddress,
            DhcpOptionCode::ServerIpAddress,
        ] {
            assert!(v4.iter().any(|o| o.option == code), "missing IPv4 {:?}", code);
        }
        assert!(v6.iter().any(|o| o.option == DhcpOptionCode::BootfileUrl));
        assert_eq!(h.dhcp.updates().len(), 2);
    }

    #[tokio::test]
    async fn test_dhcp_options_follow_configured_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.pxe.ip_version = IpVersion::V6;
        let dhcp = Arc::new(RecordingDhcpProvider::new(DhcpProviderKind::None));
        let orchestrator = BootOrchestrator::new(
            &settings,
            Collaborators {
                dhcp: dhcp.clone(),
                images: Arc::new(MockImageService::new("http://images.test")),
                nodes: Arc::new(MemoryNodeStore::default()),
                converter: Arc::new(CopyConverter::default()),
            },
        )
        .unwrap();

        orchestrator.configure_dhcp(&node()).await.unwrap();

        let options = dhcp.options_of("n1");
        assert_eq!(options.first().map(|o| o.ip_version), Some(IpVersion::V6));
        assert!(options.iter().any(|o| o.ip_version == IpVersion::V4));
    }

    #[tokio::test]
    async fn test_dhcp_update_failure_aborts_preparation() {
        let h = harness();
        let ctx = node();
        h.dhcp.fail_updates();

        let err = h.orchestrator.configure_dhcp(&ctx).await.unwrap_err();
        assert!(matches!(err, BootError::DhcpUpdateFailed(_)));

        let err = h
            .orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BootError::DhcpUpdateFailed(_)));
        assert!(!exists(&h.tftp.join("n1/config")));
    }

    #[tokio::test]
    async fn test_create_boot_config_twice_is_byte_identical() {
        let h = harness();
        let ctx = node();
        let params = BootConfigParams {
            deployment_aki_path: Some("n1/deploy_kernel".to_string()),
            deployment_ari_path: Some("n1/deploy_ramdisk".to_string()),
            ..Default::default()
        };

        h.orchestrator.create_boot_config(&ctx, &params, None).await.unwrap();
        let first = fs::read(h.tftp.join("n1/config")).unwrap();
        let report = h.orchestrator.create_boot_config(&ctx, &params, None).await.unwrap();

        assert_eq!(fs::read(h.tftp.join("n1/config")).unwrap(), first);
        assert!(report.linked.is_empty());
        assert!(report.removed.is_empty());
    }

    #[tokio::test]
    async fn test_clean_up_releases_node_links() {
        let h = harness();
        let ctx = node();
        h.orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();
        let master = h
            .orchestrator
            .image_cache()
            .master_dir()
            .unwrap()
            .join(DEPLOY_KERNEL_ID);
        assert_eq!(fs::metadata(&master).unwrap().nlink(), 2);

        h.orchestrator
            .clean_up_ramdisk(&ctx, RamdiskMode::Deploy)
            .await
            .unwrap();

        assert!(!exists(&h.tftp.join("n1")));
        assert!(!exists(&h.tftp.join("pxelinux.cfg/01-aa-bb-cc-dd-ee-ff")));
        assert!(!exists(&h.tftp.join("aa:bb:cc:dd:ee:ff.conf")));
        assert_eq!(fs::metadata(&master).unwrap().nlink(), 1);
    }

    #[tokio::test]
    async fn test_clean_up_sweeps_released_masters() {
        let h = harness();
        let settings = test_settings(h._dir.path());
        let cache = Arc::new(
            ImageCache::new(
                &settings,
                Arc::new(h.images.clone()),
                Arc::new(CopyConverter::default()),
            )
            .with_limits(1, Duration::ZERO),
        );
        let orchestrator = h.orchestrator.with_image_cache(Arc::clone(&cache));
        let ctx = node();
        orchestrator
            .prepare_ramdisk_boot(&ctx, RamdiskMode::Deploy, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(cache.entries().unwrap().len(), 4);

        orchestrator.clean_up(&ctx).await.unwrap();

        assert!(cache.entries().unwrap().is_empty());
        assert!(!exists(&h.tftp.join("n1")));
    }

    #[tokio::test]
    async fn test_clean_up_of_unprepared_node() {
        let h = harness();
        h.orchestrator.clean_up(&node()).await.unwrap();
        h.orchestrator.clean_up(&NodeBootContext::new("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn test_boot_artifact_paths() {
        let h = harness();
        let set = h
            .orchestrator
            .get_boot_artifact_paths(&node(), RamdiskMode::Deploy)
            .unwrap();
        assert_eq!(set["deploy_kernel"].path, h.tftp.join("n1/deploy_kernel"));
        assert_eq!(set["deploy_ramdisk"].href, DEPLOY_RAMDISK_ID);
    }
}
