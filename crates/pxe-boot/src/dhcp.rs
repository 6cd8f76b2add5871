//! DHCP boot options
//!
//! Computes the options an external DHCP service must serve so the node's
//! firmware finds its boot file. The builder is pure: the same context and
//! settings always yield the same ordered list.

use crate::context::{BootMode, NodeBootContext, ProtocolMode};
use crate::error::BootError;
use crate::paths::PathResolver;
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use tracing::warn;

/// Default iPXE boot script name served from the HTTP root
pub const DEFAULT_IPXE_SCRIPT_NAME: &str = "boot.ipxe";

/// IP protocol version an option is served on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    pub fn number(&self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

impl TryFrom<u8> for IpVersion {
    type Error = BootError;

    fn try_from(value: u8) -> Result<Self, BootError> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(BootError::Configuration(format!(
                "unsupported IP version {}",
                other
            ))),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(version: IpVersion) -> Self {
        version.number()
    }
}

impl FromStr for IpVersion {
    type Err = BootError;

    fn from_str(s: &str) -> Result<Self, BootError> {
        let n: u8 = s
            .trim()
            .parse()
            .map_err(|_| BootError::Configuration(format!("unsupported IP version {:?}", s)))?;
        IpVersion::try_from(n)
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// DHCP options the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhcpOptionCode {
    /// 61, RFC 2132
    ClientId,
    /// 66, RFC 2132
    TftpServerName,
    /// 67, RFC 2132
    BootfileName,
    /// 59, RFC 5970
    BootfileUrl,
    /// 150, RFC 5859
    TftpServerAddress,
    /// 175, iPXE encapsulated options
    IpxeEncapsulated,
    /// 210, RFC 5071
    PathPrefix,
    /// siaddr field of the BOOTP header
    ServerIpAddress,
}

impl DhcpOptionCode {
    /// Numeric option code; `None` for header fields
    pub fn code(&self) -> Option<u16> {
        match self {
            DhcpOptionCode::ClientId => Some(61),
            DhcpOptionCode::TftpServerName => Some(66),
            DhcpOptionCode::BootfileName => Some(67),
            DhcpOptionCode::BootfileUrl => Some(59),
            DhcpOptionCode::TftpServerAddress => Some(150),
            DhcpOptionCode::IpxeEncapsulated => Some(175),
            DhcpOptionCode::PathPrefix => Some(210),
            DhcpOptionCode::ServerIpAddress => None,
        }
    }

    /// Name as understood by dnsmasq-style backends
    pub fn wire_name(&self) -> String {
        match self.code() {
            Some(code) => code.to_string(),
            None => "server-ip-address".to_string(),
        }
    }
}

/// Client-class condition attached to an option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientClass {
    /// `tag:<name>` or `tag:!<name>`, for backends with client-class tags
    Tag { name: String, matched: bool },
    /// `175` or `!175`: whether the client sent iPXE encapsulated options
    IpxeEncapsulated { present: bool },
}

/// One DHCP option for one IP version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub option: DhcpOptionCode,
    pub value: String,
    pub ip_version: IpVersion,
    pub class: Option<ClientClass>,
}

impl DhcpOption {
    pub fn new(option: DhcpOptionCode, value: impl Into<String>, ip_version: IpVersion) -> Self {
        Self {
            option,
            value: value.into(),
            ip_version,
            class: None,
        }
    }

    pub fn with_class(mut self, class: ClientClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Option name including its client-class condition, e.g. `tag:!ipxe,67`
    pub fn opt_name(&self) -> String {
        let wire = self.option.wire_name();
        match &self.class {
            None => wire,
            Some(ClientClass::Tag { name, matched }) => {
                format!("tag:{}{},{}", if *matched { "" } else { "!" }, name, wire)
            }
            Some(ClientClass::IpxeEncapsulated { present }) => {
                let code = DhcpOptionCode::IpxeEncapsulated.wire_name();
                format!("{}{},{}", if *present { "" } else { "!" }, code, wire)
            }
        }
    }

    /// Flat form pushed to DHCP backends
    pub fn to_wire(&self) -> WireDhcpOption {
        WireDhcpOption {
            opt_name: self.opt_name(),
            opt_value: self.value.clone(),
            ip_version: self.ip_version.number(),
        }
    }
}

/// Serialized option as exchanged with DHCP backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDhcpOption {
    pub opt_name: String,
    pub opt_value: String,
    pub ip_version: u8,
}

/// What the DHCP backend can express
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DhcpCapabilities {
    pub client_class_tags: bool,
}

/// Builds DHCP options from node state and settings
#[derive(Debug, Clone)]
pub struct DhcpOptionBuilder {
    tftp_server: String,
    my_ipv6: Option<String>,
    tftp_path_prefix: String,
    http_url: Option<String>,
    ipxe_script_name: String,
    pxe_bootfile_name: String,
    uefi_pxe_bootfile_name: String,
    ipxe_bootfile_name: String,
    uefi_ipxe_bootfile_name: String,
}

impl DhcpOptionBuilder {
    pub fn from_settings(settings: &Settings) -> Self {
        let ipxe_script_name = settings
            .pxe
            .ipxe_boot_script
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_IPXE_SCRIPT_NAME.to_string());
        Self {
            tftp_server: settings.pxe.tftp_server().to_string(),
            my_ipv6: settings.pxe.my_ipv6.clone(),
            tftp_path_prefix: PathResolver::from_settings(settings).tftp_path_prefix(),
            http_url: settings.deploy.http_url.clone(),
            ipxe_script_name,
            pxe_bootfile_name: settings.pxe.pxe_bootfile_name.clone(),
            uefi_pxe_bootfile_name: settings.pxe.uefi_pxe_bootfile_name.clone(),
            ipxe_bootfile_name: settings.pxe.ipxe_bootfile_name.clone(),
            uefi_ipxe_bootfile_name: settings.pxe.uefi_ipxe_bootfile_name.clone(),
        }
    }

    /// Boot file the firmware loads first; per-node overrides win for PXE
    pub fn boot_file(&self, ctx: &NodeBootContext, protocol: ProtocolMode) -> String {
        match (ctx.boot_mode, protocol) {
            (BootMode::Uefi, ProtocolMode::Ipxe) => self.uefi_ipxe_bootfile_name.clone(),
            (BootMode::Bios, ProtocolMode::Ipxe) => self.ipxe_bootfile_name.clone(),
            (BootMode::Uefi, ProtocolMode::Pxe) => ctx
                .driver_info
                .uefi_pxe_bootfile_name
                .clone()
                .unwrap_or_else(|| self.uefi_pxe_bootfile_name.clone()),
            (BootMode::Bios, ProtocolMode::Pxe) => ctx
                .driver_info
                .pxe_bootfile_name
                .clone()
                .unwrap_or_else(|| self.pxe_bootfile_name.clone()),
        }
    }

    /// URL of the iPXE boot script
    pub fn ipxe_script_url(&self) -> String {
        match &self.http_url {
            Some(url) => format!("{}/{}", url.trim_end_matches('/'), self.ipxe_script_name),
            None => self.ipxe_script_name.clone(),
        }
    }

    fn url_host(&self, ip_version: IpVersion) -> String {
        let host = match (ip_version, &self.my_ipv6) {
            (IpVersion::V6, Some(v6)) => v6.as_str(),
            _ => self.tftp_server.as_str(),
        };
        wrap_ipv6(host)
    }

    /// Ordered options for one IP version
    pub fn build(
        &self,
        ctx: &NodeBootContext,
        protocol: ProtocolMode,
        url_boot: bool,
        ip_version: IpVersion,
        capabilities: DhcpCapabilities,
    ) -> Vec<DhcpOption> {
        let (boot_file_option, url_boot) = match ip_version {
            IpVersion::V4 => (DhcpOptionCode::BootfileName, url_boot),
            IpVersion::V6 => (DhcpOptionCode::BootfileUrl, true),
        };

        let boot_file = self.boot_file(ctx, protocol);
        let boot_file_value = if url_boot {
            format!("tftp://{}/{}", self.url_host(ip_version), boot_file)
        } else {
            boot_file
        };

        let mut options = Vec::new();
        if protocol == ProtocolMode::Ipxe {
            let script_url = self.ipxe_script_url();
            if capabilities.client_class_tags {
                let tag = match ip_version {
                    IpVersion::V4 => "ipxe",
                    IpVersion::V6 => "ipxe6",
                };
                options.push(
                    DhcpOption::new(boot_file_option, boot_file_value, ip_version).with_class(
                        ClientClass::Tag {
                            name: tag.to_string(),
                            matched: false,
                        },
                    ),
                );
                options.push(
                    DhcpOption::new(boot_file_option, script_url, ip_version).with_class(
                        ClientClass::Tag {
                            name: tag.to_string(),
                            matched: true,
                        },
                    ),
                );
            } else {
                if ip_version == IpVersion::V6 {
                    warn!(
                        "The DHCP provider for node {} cannot tag iPXE clients; IPv6 iPXE boot may not work",
                        ctx.uuid
                    );
                }
                options.push(
                    DhcpOption::new(boot_file_option, boot_file_value, ip_version)
                        .with_class(ClientClass::IpxeEncapsulated { present: false }),
                );
                options.push(DhcpOption::new(boot_file_option, script_url, ip_version));
            }
        } else {
            options.push(DhcpOption::new(boot_file_option, boot_file_value, ip_version));
            if !url_boot {
                options.push(DhcpOption::new(
                    DhcpOptionCode::PathPrefix,
                    self.tftp_path_prefix.clone(),
                    ip_version,
                ));
            }
        }

        if !url_boot {
            for code in [
                DhcpOptionCode::TftpServerName,
                DhcpOptionCode::TftpServerAddress,
                DhcpOptionCode::ServerIpAddress,
            ] {
                options.push(DhcpOption::new(code, self.tftp_server.clone(), ip_version));
            }
        }
        options
    }
}

/// Brackets IPv6 literals for use as a URL host
pub fn wrap_ipv6(host: &str) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.pxe.tftp_server = Some("192.0.2.1".to_string());
        settings.pxe.my_ipv6 = Some("2001:db8::1".to_string());
        settings.deploy.http_url = Some("http://192.0.2.1:8080/".to_string());
        settings
    }

    fn names(options: &[DhcpOption]) -> Vec<(String, String)> {
        options
            .iter()
            .map(|o| (o.opt_name(), o.value.clone()))
            .collect()
    }

    const TAGS: DhcpCapabilities = DhcpCapabilities { client_class_tags: true };
    const NO_TAGS: DhcpCapabilities = DhcpCapabilities { client_class_tags: false };

    #[test]
    fn test_pxe_v4_options() {
        let builder = DhcpOptionBuilder::from_settings(&settings());
        let ctx = NodeBootContext::new("n1");
        let options = builder.build(&ctx, ProtocolMode::Pxe, false, IpVersion::V4, NO_TAGS);
        assert_eq!(
            names(&options),
            vec![
                ("67".to_string(), "pxelinux.0".to_string()),
                ("210".to_string(), "/tftpboot/".to_string()),
                ("66".to_string(), "192.0.2.1".to_string()),
                ("150".to_string(), "192.0.2.1".to_string()),
                ("server-ip-address".to_string(), "192.0.2.1".to_string()),
            ]
        );
        assert!(options.iter().all(|o| o.ip_version == IpVersion::V4));
    }

    #[test]
    fn test_v6_always_url_boot() {
        let builder = DhcpOptionBuilder::from_settings(&settings());
        let ctx = NodeBootContext::new("n1").with_boot_mode(BootMode::Uefi);
        for protocol in [ProtocolMode::Pxe, ProtocolMode::Ipxe] {
            for caps in [TAGS, NO_TAGS] {
                let options = builder.build(&ctx, protocol, false, IpVersion::V6, caps);
                assert!(options.iter().all(|o| o.option != DhcpOptionCode::PathPrefix));
                assert!(options.iter().all(|o| o.option != DhcpOptionCode::TftpServerName));
                assert!(options.iter().all(|o| o.ip_version == IpVersion::V6));
                assert_eq!(options[0].option, DhcpOptionCode::BootfileUrl);
                assert!(options[0].value.starts_with("tftp://[2001:db8::1]/"));
            }
        }
    }

    #[test]
    fn test_v6_without_my_ipv6_uses_tftp_server() {
        let mut s = settings();
        s.pxe.my_ipv6 = None;
        s.pxe.tftp_server = Some("2001:db8::9".to_string());
        let builder = DhcpOptionBuilder::from_settings(&s);
        let options = builder.build(
            &NodeBootContext::new("n1"),
            ProtocolMode::Pxe,
            false,
            IpVersion::V6,
            NO_TAGS,
        );
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].value, "tftp://[2001:db8::9]/pxelinux.0");
        assert_eq!(options[0].opt_name(), "59");
    }

    #[test]
    fn test_ipxe_with_client_class_tags() {
        let builder = DhcpOptionBuilder::from_settings(&settings());
        let ctx = NodeBootContext::new("n1").with_protocol(ProtocolMode::Ipxe);
        let options = builder.build(&ctx, ProtocolMode::Ipxe, false, IpVersion::V4, TAGS);
        let named = names(&options);
        assert_eq!(named[0], ("tag:!ipxe,67".to_string(), "undionly.kpxe".to_string()));
        assert_eq!(
            named[1],
            ("tag:ipxe,67".to_string(), "http://192.0.2.1:8080/boot.ipxe".to_string())
        );
        assert_eq!(named.len(), 5);

        let v6 = builder.build(&ctx, ProtocolMode::Ipxe, false, IpVersion::V6, TAGS);
        assert_eq!(v6[0].opt_name(), "tag:!ipxe6,59");
        assert_eq!(v6[1].opt_name(), "tag:ipxe6,59");
    }

    #[test]
    fn test_ipxe_without_client_class_tags() {
        let builder = DhcpOptionBuilder::from_settings(&settings());
        let ctx = NodeBootContext::new("n1")
            .with_boot_mode(BootMode::Uefi)
            .with_protocol(ProtocolMode::Ipxe);
        let options = builder.build(&ctx, ProtocolMode::Ipxe, false, IpVersion::V4, NO_TAGS);
        let named = names(&options);
        assert_eq!(named[0], ("!175,67".to_string(), "ipxe.efi".to_string()));
        assert_eq!(
            named[1],
            ("67".to_string(), "http://192.0.2.1:8080/boot.ipxe".to_string())
        );
        assert!(options.iter().all(|o| o.option != DhcpOptionCode::PathPrefix));
    }

    #[test]
    fn test_url_boot_v4_and_driver_override() {
        let builder = DhcpOptionBuilder::from_settings(&settings());
        let mut ctx = NodeBootContext::new("n1").with_boot_mode(BootMode::Uefi);
        ctx.driver_info.uefi_pxe_bootfile_name = Some("grubx64.efi".to_string());
        let options = builder.build(&ctx, ProtocolMode::Pxe, true, IpVersion::V4, NO_TAGS);
        assert_eq!(
            names(&options),
            vec![("67".to_string(), "tftp://192.0.2.1/grubx64.efi".to_string())]
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = DhcpOptionBuilder::from_settings(&settings());
        let ctx = NodeBootContext::new("n1").with_protocol(ProtocolMode::Ipxe);
        let a = builder.build(&ctx, ProtocolMode::Ipxe, false, IpVersion::V4, TAGS);
        let b = builder.build(&ctx, ProtocolMode::Ipxe, false, IpVersion::V4, TAGS);
        assert_eq!(a, b);
    }

    #[test]
    fn test_wire_form() {
        let option = DhcpOption::new(DhcpOptionCode::BootfileName, "pxelinux.0", IpVersion::V4)
            .with_class(ClientClass::Tag {
                name: "ipxe".to_string(),
                matched: false,
            });
        let json = serde_json::to_value(option.to_wire()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"opt_name": "tag:!ipxe,67", "opt_value": "pxelinux.0", "ip_version": 4})
        );
        assert_eq!(DhcpOptionCode::ClientId.code(), Some(61));
    }

    #[test]
    fn test_ip_version_parsing() {
        assert_eq!("4".parse::<IpVersion>().unwrap(), IpVersion::V4);
        assert_eq!("6".parse::<IpVersion>().unwrap(), IpVersion::V6);
        assert!("5".parse::<IpVersion>().is_err());
        assert_eq!(wrap_ipv6("10.0.0.1"), "10.0.0.1");
        assert_eq!(wrap_ipv6("fe80::1"), "[fe80::1]");
    }
}
