//! Supporting types shared by the Instance and InstancePool CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Port layout a device is converted to after its first boot
///
/// The CRD carries the topology as a free-form string so that an unknown
/// value reaches the reconciler as a configuration error instead of failing
/// deserialization of the whole object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkType {
    /// Routed primary bond with public and private address families
    Layer3,
    /// Every physical port switched on its own
    Layer2Individual,
    /// Bonded physical ports in switched mode
    Layer2Bonded,
    /// Primary bond stays routed, odd-numbered ports are split out for VLANs
    Hybrid,
    /// Primary bond stays routed and carries the VLANs
    HybridBonded,
}

impl NetworkType {
    /// All supported topology names, in the order they are documented
    pub const ALL: [NetworkType; 5] = [
        Self::Layer3,
        Self::Layer2Individual,
        Self::Layer2Bonded,
        Self::Hybrid,
        Self::HybridBonded,
    ];

    /// Wire name of the topology
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Layer3 => "layer3",
            Self::Layer2Individual => "layer2-individual",
            Self::Layer2Bonded => "layer2-bonded",
            Self::Hybrid => "hybrid",
            Self::HybridBonded => "hybrid-bonded",
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NetworkType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                crate::Error::validation(format!(
                    "unknown network type '{s}', expected one of: layer3, layer2-individual, layer2-bonded, hybrid, hybrid-bonded"
                ))
            })
    }
}

/// Requested network topology and VLAN assignments for a device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingConfiguration {
    /// Topology name (layer3, layer2-individual, layer2-bonded, hybrid, hybrid-bonded)
    #[serde(rename = "type", default)]
    pub network_type: String,

    /// Per-port VLAN assignments applied after the conversion
    #[serde(rename = "interfaceConfiguration", default)]
    pub interfaces: Vec<InterfaceConfiguration>,
}

impl NetworkingConfiguration {
    /// True when no topology was requested
    pub fn is_empty(&self) -> bool {
        self.network_type.is_empty()
    }

    /// Parse the requested topology
    pub fn parsed_type(&self) -> crate::Result<NetworkType> {
        self.network_type.parse()
    }
}

/// VLANs to attach to one named port
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct InterfaceConfiguration {
    /// Port name on the device (e.g. "bond0", "eth1")
    pub name: String,

    /// VLAN identifiers (virtual network ids or VXLAN tags) to assign
    #[serde(rename = "vlanIDS", default)]
    pub vlan_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_network_type_round_trips_through_its_name() {
        for t in NetworkType::ALL {
            assert_eq!(t.as_str().parse::<NetworkType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_network_type_is_a_validation_error() {
        let err = "layer4".parse::<NetworkType>().unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("layer4"));
    }

    #[test]
    fn networking_configuration_uses_wire_field_names() {
        let cfg: NetworkingConfiguration = serde_json::from_str(
            r#"{"type":"hybrid","interfaceConfiguration":[{"name":"eth1","vlanIDS":["1000","1001"]}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.parsed_type().unwrap(), NetworkType::Hybrid);
        assert_eq!(cfg.interfaces[0].vlan_ids, vec!["1000", "1001"]);
        assert!(!cfg.is_empty());
        assert!(NetworkingConfiguration::default().is_empty());
    }
}
