//! Wire model of the metal provisioning API
//!
//! Only the fields the operator reads or writes are modelled; everything else
//! in the API responses is ignored on deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Devices
// =============================================================================

/// A physical machine as the backend reports it
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Device {
    /// Device identifier
    pub id: String,
    /// Hostname the device was created with
    #[serde(default)]
    pub hostname: String,
    /// Backend lifecycle state ("queued", "provisioning", "active", ...)
    #[serde(default)]
    pub state: String,
    /// Device-level network topology as computed by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    /// Boot script currently configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipxe_script_url: Option<String>,
    /// Userdata currently configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
    /// Physical and bond ports
    #[serde(default)]
    pub network_ports: Vec<Port>,
    /// Assigned addresses
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
}

impl Device {
    /// Parsed lifecycle state
    pub fn device_state(&self) -> DeviceState {
        DeviceState::from(self.state.as_str())
    }

    /// Port with the given name
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.network_ports.iter().find(|p| p.name == name)
    }

    /// First public IPv4 address
    pub fn public_ipv4(&self) -> Option<String> {
        self.ipv4(true)
    }

    /// First private IPv4 address
    pub fn private_ipv4(&self) -> Option<String> {
        self.ipv4(false)
    }

    fn ipv4(&self, public: bool) -> Option<String> {
        self.ip_addresses
            .iter()
            .find(|ip| ip.address_family == 4 && ip.public == public)
            .map(|ip| ip.address.clone())
    }
}

/// Backend lifecycle state of a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Waiting for hardware
    Queued,
    /// Being provisioned
    Provisioning,
    /// Running
    Active,
    /// Being reinstalled
    Reinstalling,
    /// Powered off
    Inactive,
    /// Provisioning failed
    Failed,
    /// Being torn down
    Deprovisioning,
    /// Any state the operator has no special handling for
    Other(String),
}

impl DeviceState {
    /// True when the backend is not in the middle of an operation on the device
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Active | Self::Inactive)
    }

    /// Wire name of the state
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Reinstalling => "reinstalling",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
            Self::Deprovisioning => "deprovisioning",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "provisioning" => Self::Provisioning,
            "active" => Self::Active,
            "reinstalling" => Self::Reinstalling,
            "inactive" => Self::Inactive,
            "failed" => Self::Failed,
            "deprovisioning" => Self::Deprovisioning,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address assigned to a device
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IpAddress {
    /// Address without prefix length
    pub address: String,
    /// 4 or 6
    pub address_family: u8,
    /// Publicly routable
    #[serde(default)]
    pub public: bool,
}

// =============================================================================
// Ports
// =============================================================================

/// Port type reported for bond ports
pub const BOND_PORT_TYPE: &str = "NetworkBondPort";

/// A network port of a device
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Port {
    /// Port identifier
    pub id: String,
    /// Port name ("bond0", "eth0", ...)
    pub name: String,
    /// "NetworkPort" or "NetworkBondPort"
    #[serde(rename = "type", default)]
    pub port_type: String,
    /// Per-port mode ("layer3", "layer2-individual", "layer2-bonded", "hybrid")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    /// Port details
    #[serde(default)]
    pub data: PortData,
    /// Attached virtual networks
    #[serde(default)]
    pub virtual_networks: Vec<Href>,
}

impl Port {
    /// True for bond (aggregate) ports
    pub fn is_bond(&self) -> bool {
        self.port_type == BOND_PORT_TYPE
    }

    /// True when `vnid` is already attached to the port
    pub fn has_vlan(&self, vnid: &str) -> bool {
        self.virtual_networks
            .iter()
            .any(|vn| vn.href.rsplit('/').next() == Some(vnid))
    }
}

/// Port details
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PortData {
    /// MAC address of physical ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Whether the port is part of a bond
    #[serde(default)]
    pub bonded: bool,
}

/// Link to another API object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Href {
    /// Path of the object
    pub href: String,
}

// =============================================================================
// Requests
// =============================================================================

/// Body of a device creation request
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct DeviceCreateRequest {
    /// Hostname, equal to the Instance name
    pub hostname: String,
    /// Machine class
    pub plan: String,
    /// Candidate facilities
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub facility: Vec<String>,
    /// Metro
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,
    /// OS image selector
    pub operating_system: String,
    /// Billing cycle
    #[serde(skip_serializing_if = "String::is_empty")]
    pub billing_cycle: String,
    /// Boot configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
    /// Tags
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// First-boot iPXE script
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipxe_script_url: Option<String>,
    /// Public IPv4 subnet size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv4_subnet_size: Option<i32>,
    /// Always boot from iPXE
    pub always_pxe: bool,
    /// Hardware reservation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_reservation_id: Option<String>,
    /// Spot-market device
    pub spot_instance: bool,
    /// Spot price ceiling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spot_price_max: Option<f64>,
    /// Custom metadata
    #[serde(rename = "customdata", skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<String>,
    /// User SSH key ids
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_ssh_keys: Vec<String>,
    /// Project SSH key ids
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub project_ssh_keys: Vec<String>,
    /// Feature flags
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, String>,
    /// Inject no SSH keys
    pub no_ssh_keys: bool,
}

/// Body of a device update request
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct DeviceUpdateRequest {
    /// New boot script
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipxe_script_url: Option<String>,
    /// New userdata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
}

/// Body of a device reinstall action
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ReinstallRequest {
    /// Always "reinstall"
    #[serde(rename = "type")]
    pub action: &'static str,
    /// Keep the non-OS disks
    pub preserve_data: bool,
    /// Skip disk wiping
    pub deprovision_fast: bool,
}

impl ReinstallRequest {
    /// Reinstall keeping data and skipping the wipe
    pub fn preserving_data() -> Self {
        Self {
            action: "reinstall",
            preserve_data: true,
            deprovision_fast: true,
        }
    }
}

/// Address family requested when a port is converted to layer 3
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct AddressRequest {
    /// 4 or 6
    pub address_family: u8,
    /// Publicly routable
    pub public: bool,
}

impl AddressRequest {
    /// The address families of a routed primary bond: v4 public, v4 private, v6 public
    pub fn layer3_defaults() -> Vec<Self> {
        vec![
            Self {
                address_family: 4,
                public: true,
            },
            Self {
                address_family: 4,
                public: false,
            },
            Self {
                address_family: 6,
                public: true,
            },
        ]
    }
}

/// One page of a device listing
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeviceList {
    /// Devices on this page
    #[serde(default)]
    pub devices: Vec<Device>,
    /// Pagination
    #[serde(default)]
    pub meta: ListMeta,
}

/// Pagination metadata
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListMeta {
    /// Link to the next page
    #[serde(default)]
    pub next: Option<Href>,
}
