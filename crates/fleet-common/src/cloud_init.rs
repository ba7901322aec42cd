//! Boot configuration documents handed to devices as userdata
//!
//! A document is a `#cloud-config` marker line followed by YAML the installer
//! reads to join the machine to the cluster. Fields this module does not model
//! are carried through unchanged when a document is rewritten.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Marker line every boot configuration starts with
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

/// Name of the management network block written on reconfiguration
pub const MANAGEMENT_NETWORK: &str = "harvester-mgmt";

/// Port the join address serves the registration endpoint on
pub const JOIN_PORT: u16 = 8443;

/// Install mode for machines added to an existing cluster
pub const INSTALL_MODE_JOIN: &str = "join";

/// Serial console the installer writes to
pub const INSTALL_TTY: &str = "ttyS1,115200n8";

/// Disk the installer writes to
pub const INSTALL_DEVICE: &str = "/dev/sda";

/// Top-level boot configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct BootConfig {
    /// Registration endpoint of the cluster being joined
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_url: String,

    /// Cluster join token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,

    /// Operating system settings
    #[serde(default)]
    pub os: OsConfig,

    /// Installer settings
    #[serde(default)]
    pub install: InstallConfig,

    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Operating system section
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct OsConfig {
    /// Hostname, equal to the Instance name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Admin password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Installer section
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InstallConfig {
    /// Run the installer without prompting
    #[serde(default)]
    pub automatic: bool,

    /// Install mode ("join" for pool members)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,

    /// Console for installer output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tty: String,

    /// Target disk
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,

    /// Installer ISO
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iso_url: String,

    /// Named network definitions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Network>,

    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A network definition in the installer section
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Network {
    /// Member interfaces, matched by MAC address
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,

    /// Address assignment method
    #[serde(default)]
    pub method: String,

    /// Whether this network carries the default route
    #[serde(default)]
    pub default_route: bool,

    /// Bonding options when more than one interface is listed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bond_options: BTreeMap<String, String>,
}

/// One interface in a network definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetworkInterface {
    /// MAC address
    #[serde(rename = "hwAddr")]
    pub hw_addr: String,
}

impl BootConfig {
    /// Document that joins a fresh machine to the cluster reachable at `join_address`
    pub fn join(
        join_address: &str,
        token: impl Into<String>,
        hostname: impl Into<String>,
        password: impl Into<String>,
        iso_url: impl Into<String>,
    ) -> Self {
        Self {
            server_url: format!("https://{join_address}:{JOIN_PORT}"),
            token: token.into(),
            os: OsConfig {
                hostname: hostname.into(),
                password: password.into(),
                ..Default::default()
            },
            install: InstallConfig {
                automatic: true,
                mode: INSTALL_MODE_JOIN.to_string(),
                tty: INSTALL_TTY.to_string(),
                device: INSTALL_DEVICE.to_string(),
                iso_url: iso_url.into(),
                ..Default::default()
            },
            extra: BTreeMap::new(),
        }
    }

    /// Parse a document, with or without the marker line
    pub fn parse(document: &str) -> crate::Result<Self> {
        let body = document
            .strip_prefix(CLOUD_CONFIG_HEADER)
            .unwrap_or(document);
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(body)
            .map_err(|e| Error::serialization_for_kind("cloud-config", e.to_string()))
    }

    /// Render the document with its marker line
    pub fn render(&self) -> crate::Result<String> {
        let body = serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("cloud-config", e.to_string()))?;
        Ok(format!("{CLOUD_CONFIG_HEADER}\n{body}"))
    }

    /// Replace the management network with one built from `mac_addresses`
    ///
    /// The network uses DHCP and carries the default route. Applying the same
    /// addresses twice yields the same document.
    pub fn set_management_network(
        &mut self,
        mac_addresses: &[String],
        bond_options: &BTreeMap<String, String>,
    ) {
        let network = Network {
            interfaces: mac_addresses
                .iter()
                .map(|mac| NetworkInterface {
                    hw_addr: mac.clone(),
                })
                .collect(),
            method: "dhcp".to_string(),
            default_route: true,
            bond_options: bond_options.clone(),
        };
        self.install
            .networks
            .insert(MANAGEMENT_NETWORK.to_string(), network);
    }
}
