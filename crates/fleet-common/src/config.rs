//! Operator configuration
//!
//! Every value has a default matching the stock deployment. The binary
//! overrides them from command-line flags and environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Namespace holding the provisioning credential secret
pub const DEFAULT_NAMESPACE: &str = "harvester-system";

/// Name of the provisioning credential secret
pub const DEFAULT_CREDENTIAL_SECRET: &str = "equinix-addon";

/// Base URL of the metal provisioning API
pub const DEFAULT_METAL_API_URL: &str = "https://api.equinix.com/metal/v1";

/// Bootstrap document holding the cluster join token
pub const DEFAULT_BOOTSTRAP_CONFIG_PATH: &str = "/etc/rancher/rancherd/config.yaml";

/// Installer ISO used when a pool does not name one
pub const DEFAULT_ISO_URL: &str =
    "https://releases.rancher.com/harvester/master/harvester-master-amd64.iso";

/// iPXE script a device boots from after reconfiguration
pub const DEFAULT_IPXE_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/ibrokethecloud/custom_pxe/master/master.ipxe";

/// iPXE script a device boots from on first provisioning
pub const INITIAL_IPXE_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/ibrokethecloud/custom_pxe/master/shell.ipxe";

/// Management interface used when a pool does not list any
pub const DEFAULT_INTERFACE: &str = "eth0";

/// LoadBalancer Service whose ingress address is the cluster join address
pub const DEFAULT_INGRESS_SERVICE: &str = "ingress-expose";

/// Namespace of the ingress Service
pub const DEFAULT_INGRESS_NAMESPACE: &str = "kube-system";

/// Delay between polls of the provisioning backend
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);

/// Delay between checks for a cluster member to appear
pub const DEFAULT_READY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime configuration shared by both controllers
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace of the credential secret
    pub namespace: String,
    /// Name of the credential secret
    pub credential_secret: String,
    /// Base URL of the metal API
    pub metal_api_url: String,
    /// Join token supplied directly (takes precedence over the bootstrap document)
    pub join_token: Option<String>,
    /// Path of the bootstrap document holding the join token
    pub bootstrap_config_path: PathBuf,
    /// Default installer ISO
    pub iso_url: String,
    /// Default iPXE script for reinstalls
    pub ipxe_script_url: String,
    /// iPXE script for first boot
    pub initial_ipxe_script_url: String,
    /// Default management interface
    pub default_interface: String,
    /// Ingress Service name used for the join address
    pub ingress_service: String,
    /// Ingress Service namespace
    pub ingress_namespace: String,
    /// Requeue delay while waiting on the provisioning backend
    pub poll_interval: Duration,
    /// Requeue delay while waiting for a cluster member to appear
    pub ready_check_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            credential_secret: DEFAULT_CREDENTIAL_SECRET.to_string(),
            metal_api_url: DEFAULT_METAL_API_URL.to_string(),
            join_token: None,
            bootstrap_config_path: PathBuf::from(DEFAULT_BOOTSTRAP_CONFIG_PATH),
            iso_url: DEFAULT_ISO_URL.to_string(),
            ipxe_script_url: DEFAULT_IPXE_SCRIPT_URL.to_string(),
            initial_ipxe_script_url: INITIAL_IPXE_SCRIPT_URL.to_string(),
            default_interface: DEFAULT_INTERFACE.to_string(),
            ingress_service: DEFAULT_INGRESS_SERVICE.to_string(),
            ingress_namespace: DEFAULT_INGRESS_NAMESPACE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_check_interval: DEFAULT_READY_CHECK_INTERVAL,
        }
    }
}

impl OperatorConfig {
    /// Check the values the controllers cannot work without
    pub fn validate(&self) -> crate::Result<()> {
        let required = [
            ("namespace", &self.namespace),
            ("credential secret", &self.credential_secret),
            ("metal API URL", &self.metal_api_url),
            ("ingress service", &self.ingress_service),
        ];
        for (what, value) in required {
            if value.trim().is_empty() {
                return Err(crate::Error::configuration(
                    "operator",
                    format!("{what} must not be empty"),
                ));
            }
        }
        if self.poll_interval.is_zero() || self.ready_check_interval.is_zero() {
            return Err(crate::Error::configuration(
                "operator",
                "requeue intervals must be greater than zero",
            ));
        }
        Ok(())
    }
}
