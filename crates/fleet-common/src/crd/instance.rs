//! Instance CRD types
//!
//! An `Instance` mirrors one physical machine. The pool controller creates it,
//! the instance controller drives it from an empty record to a cluster member
//! and deprovisions the device when the record is deleted.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::NetworkingConfiguration;
use crate::kube_utils::parse_duration;
use crate::{PASSWORD_ANNOTATION, POOL_LABEL, REINSTALL_IPXE_ANNOTATION, TOKEN_ANNOTATION};

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of an Instance
///
/// Transitions only move forward. The one way back is remediation, which
/// deletes a Managed Instance so that its pool provisions a replacement.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InstancePhase {
    /// Nothing has been requested from the provisioning backend yet
    #[default]
    Empty,
    /// A device was created and is being provisioned
    Submitted,
    /// The device is being reinstalled with its final boot configuration
    Reinstalling,
    /// The device is active and waiting to join the cluster
    Ready,
    /// The machine is a cluster member
    Managed,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Submitted => write!(f, "submitted"),
            Self::Reinstalling => write!(f, "reinstalling"),
            Self::Ready => write!(f, "ready"),
            Self::Managed => write!(f, "managed"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// One bare-metal machine provisioned through the metal API
///
/// Example:
/// ```yaml
/// apiVersion: metal.fleet.dev/v1alpha1
/// kind: Instance
/// metadata:
///   name: edge-pool-qwertyui
/// spec:
///   plan: c3.small.x86
///   metro: da
///   operatingSystem: custom_ipxe
///   billingCycle: hourly
///   nodeCleanupWaitInterval: 10m
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metal.fleet.dev",
    version = "v1alpha1",
    kind = "Instance",
    plural = "instances",
    shortname = "inst",
    status = "InstanceStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".status.instanceID"}"#,
    printcolumn = r#"{"name":"Public IP","type":"string","jsonPath":".status.publicIP"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Machine class (e.g. "c3.small.x86")
    pub plan: String,

    /// Candidate facilities, mutually exclusive with `metro`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facility: Vec<String>,

    /// Metro to provision in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,

    /// OS image selector ("custom_ipxe" for pool-created instances)
    pub operating_system: String,

    /// Billing cycle (e.g. "hourly")
    #[serde(default)]
    pub billing_cycle: String,

    /// Project the device belongs to
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Boot configuration document handed to the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,

    /// Device tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Free-form device description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// iPXE script used for the first boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipxe_script_url: Option<String>,

    /// Size of the public IPv4 subnet to assign
    #[serde(
        rename = "publicIPv4SubnetSize",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub public_ipv4_subnet_size: Option<i32>,

    /// Always boot from iPXE
    #[serde(default)]
    pub always_pxe: bool,

    /// Hardware reservation to provision onto
    #[serde(
        rename = "hardwareReservationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hardware_reservation_id: Option<String>,

    /// Request a spot-market device
    #[serde(default)]
    pub spot_instance: bool,

    /// Maximum spot price per hour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price_max: Option<f64>,

    /// Custom metadata passed to the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<String>,

    /// User SSH key ids
    #[serde(rename = "usersshKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub user_ssh_keys: Vec<String>,

    /// Project SSH key ids
    #[serde(rename = "projectsshKeys", default, skip_serializing_if = "Vec::is_empty")]
    pub project_ssh_keys: Vec<String>,

    /// Device feature flags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, String>,

    /// Do not inject any SSH keys
    #[serde(rename = "nosshKeys", default)]
    pub no_ssh_keys: bool,

    /// How long the cluster member may stay NotReady before the Instance is replaced
    /// (duration string such as "10m" or "1h30m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_cleanup_wait_interval: Option<String>,

    /// Interfaces whose MAC addresses form the management network
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub management_interfaces: Vec<String>,

    /// Bonding options for the management network
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub management_bonding_options: BTreeMap<String, String>,

    /// Topology conversion applied when the device is reconfigured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking_configuration: Option<NetworkingConfiguration>,
}

impl InstanceSpec {
    /// Parsed cleanup wait interval, if one is set
    pub fn cleanup_wait(&self) -> crate::Result<Option<Duration>> {
        self.node_cleanup_wait_interval
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(parse_duration)
            .transpose()
            .map_err(|e| {
                crate::Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    "spec.nodeCleanupWaitInterval",
                    e,
                )
            })
    }
}

/// Observed state of an Instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: InstancePhase,

    /// Device identifier assigned by the provisioning backend
    #[serde(rename = "instanceID", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Last device state reported by the backend (e.g. "queued", "active")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_state: Option<String>,

    /// Public IPv4 address
    #[serde(rename = "publicIP", default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Private IPv4 address
    #[serde(rename = "privateIP", default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
}

impl Instance {
    /// Current phase, `Empty` when no status has been written yet
    pub fn phase(&self) -> InstancePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Device identifier, if one was ever assigned
    pub fn device_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.instance_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Name of the owning pool taken from the pool label
    pub fn pool_name(&self) -> Option<&str> {
        self.labels().get(POOL_LABEL).map(String::as_str)
    }

    /// True when a deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Provisioning API token carried in the annotations
    pub fn api_token(&self) -> Option<&str> {
        self.annotation(TOKEN_ANNOTATION)
    }

    /// Admin password generated for the machine
    pub fn password(&self) -> Option<&str> {
        self.annotation(PASSWORD_ANNOTATION)
    }

    /// iPXE script to boot from when the device is reinstalled
    pub fn reinstall_ipxe_url(&self) -> Option<&str> {
        self.annotation(REINSTALL_IPXE_ANNOTATION)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
