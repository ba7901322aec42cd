//! InstancePool CRD types
//!
//! An `InstancePool` declares how many identically templated machines should
//! exist. Its Instances are found through the pool label, never through a
//! list stored on the pool.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::NetworkingConfiguration;

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of an InstancePool
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PoolPhase {
    /// No join token has been resolved yet
    #[default]
    Empty,
    /// Join token cached, Instances need to be created
    TokenReady,
    /// Instances were requested and are converging
    Submitted,
    /// Every requested Instance is a cluster member
    Ready,
    /// The pool holds more Instances than it wants
    CleanupNodes,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::TokenReady => write!(f, "tokenReady"),
            Self::Submitted => write!(f, "submitted"),
            Self::Ready => write!(f, "ready"),
            Self::CleanupNodes => write!(f, "cleanupNodes"),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// A fleet of identically templated bare-metal machines
///
/// Example:
/// ```yaml
/// apiVersion: metal.fleet.dev/v1alpha1
/// kind: InstancePool
/// metadata:
///   name: edge-pool
/// spec:
///   count: 3
///   plan: c3.small.x86
///   metro: da
///   billingCycle: hourly
///   managementInterfaces: [eth0, eth1]
///   networkingConfiguration:
///     type: hybrid
///     interfaceConfiguration:
///       - name: eth1
///         vlanIDS: ["1000"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "metal.fleet.dev",
    version = "v1alpha1",
    kind = "InstancePool",
    plural = "instancepools",
    shortname = "ipool",
    status = "InstancePoolStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Count","type":"integer","jsonPath":".spec.count"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstancePoolSpec {
    /// Desired number of Instances
    pub count: i32,

    /// Billing cycle for every device
    #[serde(default)]
    pub billing_cycle: String,

    /// Request spot-market devices
    #[serde(default)]
    pub spot_instance: bool,

    /// Maximum spot price per hour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price_max: Option<f64>,

    /// Custom metadata passed to every device
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

    /// Interfaces forming the management network (defaults to eth0)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub management_interfaces: Vec<String>,

    /// Bonding options for the management network
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub management_bonding_options: BTreeMap<String, String>,

    /// iPXE script used when devices are reinstalled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipxe_script_url: Option<String>,

    /// Installer ISO location
    #[serde(rename = "isoUrl", default, skip_serializing_if = "Option::is_none")]
    pub iso_url: Option<String>,

    /// Machine class
    pub plan: String,

    /// Metro to provision in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,

    /// Candidate facilities
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facility: Vec<String>,

    /// How long a member may stay NotReady before its Instance is replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_cleanup_wait_interval: Option<String>,

    /// Topology conversion applied to every device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking_configuration: Option<NetworkingConfiguration>,
}

impl InstancePoolSpec {
    /// Reject specs the pool controller cannot act on
    pub fn validate(&self) -> crate::Result<()> {
        if self.count < 0 {
            return Err(crate::Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "spec.count",
                format!("count must not be negative, got {}", self.count),
            ));
        }
        if self.plan.is_empty() {
            return Err(crate::Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "spec.plan",
                "plan is required",
            ));
        }
        if let Some(networking) = self.networking_configuration.as_ref() {
            if !networking.is_empty() {
                networking.parsed_type()?;
            }
        }
        Ok(())
    }
}

/// Observed state of an InstancePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstancePoolStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: PoolPhase,

    /// Instances that are cluster members
    #[serde(default)]
    pub ready: i32,

    /// Instances the pool currently accounts for
    #[serde(default)]
    pub requested: i32,

    /// Instances still to create (positive) or delete (negative)
    #[serde(default)]
    pub needed: i32,

    /// Cached cluster join token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl InstancePool {
    /// Current phase, `Empty` when no status has been written yet
    pub fn phase(&self) -> PoolPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
