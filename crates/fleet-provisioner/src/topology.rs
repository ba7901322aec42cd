//! Network topology conversion planning
//!
//! Converting a device between topologies is a fixed sequence of port
//! operations per target type. The planner turns the device's current ports
//! and the requested configuration into the list of calls still needed:
//!
//! - layer3: disbond the bond ports, route the primary bond (v4 public,
//!   v4 private, v6 public), then bond the physical ports again
//! - layer2-individual: switch the primary bond to layer 2, then disbond
//!   every physical port
//! - layer2-bonded: switch every bond port to layer 2, then bond the
//!   physical ports
//! - hybrid: disbond eth1 and eth3, leaving the rest bonded and routed
//! - hybrid-bonded: no port changes
//!
//! VLAN assignments from the configuration follow the structural steps.
//!
//! The plan is simulated against a copy of the port state, and steps that
//! would not change anything are dropped. Running the planner again after a
//! partially applied conversion therefore only yields the remaining steps.

use fleet_common::crd::{NetworkType, NetworkingConfiguration};

use crate::error::ProvisionerError;
use crate::types::{AddressRequest, Device, Port};

/// Name of the primary bond port
pub const PRIMARY_BOND: &str = "bond0";

/// Physical ports split out of the bond in hybrid mode
pub const HYBRID_PORTS: [&str; 2] = ["eth1", "eth3"];

/// One port operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortAction {
    /// Remove the port from its bond
    Disbond {
        /// Port id
        port_id: String,
        /// Port name
        name: String,
    },
    /// Add the port to its bond
    Bond {
        /// Port id
        port_id: String,
        /// Port name
        name: String,
    },
    /// Switch the port to layer 2
    ConvertLayer2 {
        /// Port id
        port_id: String,
        /// Port name
        name: String,
    },
    /// Switch the port to layer 3
    ConvertLayer3 {
        /// Port id
        port_id: String,
        /// Port name
        name: String,
        /// Address families to request
        addresses: Vec<AddressRequest>,
    },
    /// Attach a virtual network
    AssignVlan {
        /// Port id
        port_id: String,
        /// Port name
        name: String,
        /// Virtual network id
        vnid: String,
    },
}

impl PortAction {
    /// Name of the port the action applies to
    pub fn port_name(&self) -> &str {
        match self {
            Self::Disbond { name, .. }
            | Self::Bond { name, .. }
            | Self::ConvertLayer2 { name, .. }
            | Self::ConvertLayer3 { name, .. }
            | Self::AssignVlan { name, .. } => name,
        }
    }
}

/// Mutable view of a port used while simulating a plan
#[derive(Clone, Debug)]
struct SimPort {
    id: String,
    name: String,
    bond: bool,
    bonded: bool,
    network_type: Option<String>,
    vlans: Vec<String>,
}

impl From<&Port> for SimPort {
    fn from(p: &Port) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            bond: p.is_bond(),
            bonded: p.data.bonded,
            network_type: p.network_type.clone(),
            vlans: p
                .virtual_networks
                .iter()
                .filter_map(|vn| vn.href.rsplit('/').next().map(String::from))
                .collect(),
        }
    }
}

struct Simulation {
    device_id: String,
    ports: Vec<SimPort>,
    actions: Vec<PortAction>,
}

impl Simulation {
    fn new(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            ports: device.network_ports.iter().map(SimPort::from).collect(),
            actions: Vec::new(),
        }
    }

    fn index(&self, name: &str) -> Result<usize, ProvisionerError> {
        self.ports
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| ProvisionerError::MissingPort {
                device: self.device_id.clone(),
                port: name.to_string(),
            })
    }

    fn names(&self, bond: bool) -> Vec<String> {
        self.ports
            .iter()
            .filter(|p| p.bond == bond)
            .map(|p| p.name.clone())
            .collect()
    }

    fn disbond(&mut self, name: &str) -> Result<(), ProvisionerError> {
        let i = self.index(name)?;
        if !self.ports[i].bonded {
            return Ok(());
        }
        let is_bond = self.ports[i].bond;
        for port in self.ports.iter_mut() {
            if port.name == name || (is_bond && !port.bond) {
                port.bonded = false;
            }
        }
        let p = &self.ports[i];
        self.actions.push(PortAction::Disbond {
            port_id: p.id.clone(),
            name: p.name.clone(),
        });
        Ok(())
    }

    fn bond(&mut self, name: &str) -> Result<(), ProvisionerError> {
        let i = self.index(name)?;
        if self.ports[i].bonded {
            return Ok(());
        }
        self.ports[i].bonded = true;
        for port in self.ports.iter_mut().filter(|p| p.bond) {
            port.bonded = true;
        }
        let p = &self.ports[i];
        self.actions.push(PortAction::Bond {
            port_id: p.id.clone(),
            name: p.name.clone(),
        });
        Ok(())
    }

    fn convert_layer2(&mut self, name: &str) -> Result<(), ProvisionerError> {
        let i = self.index(name)?;
        let p = &mut self.ports[i];
        if p.network_type.as_deref().is_some_and(|t| t.starts_with("layer2")) {
            return Ok(());
        }
        p.network_type = Some(
            if p.bonded {
                "layer2-bonded"
            } else {
                "layer2-individual"
            }
            .to_string(),
        );
        self.actions.push(PortAction::ConvertLayer2 {
            port_id: p.id.clone(),
            name: p.name.clone(),
        });
        Ok(())
    }

    fn convert_layer3(&mut self, name: &str) -> Result<(), ProvisionerError> {
        let i = self.index(name)?;
        let p = &mut self.ports[i];
        if p.network_type.as_deref() == Some("layer3") {
            return Ok(());
        }
        p.network_type = Some("layer3".to_string());
        self.actions.push(PortAction::ConvertLayer3 {
            port_id: p.id.clone(),
            name: p.name.clone(),
            addresses: AddressRequest::layer3_defaults(),
        });
        Ok(())
    }

    fn assign_vlan(&mut self, name: &str, vnid: &str) -> Result<(), ProvisionerError> {
        let i = self.index(name)?;
        let p = &mut self.ports[i];
        if p.vlans.iter().any(|v| v == vnid) {
            return Ok(());
        }
        p.vlans.push(vnid.to_string());
        self.actions.push(PortAction::AssignVlan {
            port_id: p.id.clone(),
            name: p.name.clone(),
            vnid: vnid.to_string(),
        });
        Ok(())
    }
}

/// Port operations still needed to bring `device` to `config`
///
/// A device the backend already reports as the target type gets no
/// structural steps, only missing VLAN assignments.
pub fn plan_conversion(
    device: &Device,
    config: &NetworkingConfiguration,
) -> Result<Vec<PortAction>, ProvisionerError> {
    let target: NetworkType = config
        .network_type
        .parse()
        .map_err(|_| ProvisionerError::UnknownNetworkType(config.network_type.clone()))?;

    let mut sim = Simulation::new(device);
    let already_converted = device.network_type.as_deref() == Some(target.as_str());

    if !already_converted {
        match target {
            NetworkType::Layer3 => {
                for bond in sim.names(true) {
                    sim.disbond(&bond)?;
                }
                sim.convert_layer3(PRIMARY_BOND)?;
                for eth in sim.names(false) {
                    sim.bond(&eth)?;
                }
            }
            NetworkType::Layer2Individual => {
                sim.convert_layer2(PRIMARY_BOND)?;
                for eth in sim.names(false) {
                    sim.disbond(&eth)?;
                }
            }
            NetworkType::Layer2Bonded => {
                for bond in sim.names(true) {
                    sim.convert_layer2(&bond)?;
                }
                for eth in sim.names(false) {
                    sim.bond(&eth)?;
                }
            }
            NetworkType::Hybrid => {
                for eth in HYBRID_PORTS {
                    if sim.index(eth).is_ok() {
                        sim.disbond(eth)?;
                    }
                }
            }
            NetworkType::HybridBonded => {}
        }
    }

    for iface in &config.interfaces {
        for vnid in &iface.vlan_ids {
            sim.assign_vlan(&iface.name, vnid)?;
        }
    }

    Ok(sim.actions)
}
