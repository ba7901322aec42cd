//! Common types for the bare-metal fleet operator: CRDs, errors, configuration
//! and the helpers shared by the Instance and InstancePool controllers.

#![deny(missing_docs)]

pub mod cloud_init;
pub mod config;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod relations;
pub mod retry;
pub mod telemetry;

pub use config::OperatorConfig;
pub use credentials::MetalCredentials;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for fleet CRDs
pub const API_GROUP: &str = "metal.fleet.dev";

/// API version string for fleet CRDs (`group/version`)
pub const API_VERSION: &str = "metal.fleet.dev/v1alpha1";

/// Label linking an Instance to the InstancePool that created it
pub const POOL_LABEL: &str = "metal.fleet.dev/pool";

/// Finalizer guarding remote deprovisioning of an Instance's device
pub const INSTANCE_FINALIZER: &str = "metal.fleet.dev/deprovision";

/// Annotation carrying the provisioning API token on an Instance
pub const TOKEN_ANNOTATION: &str = "metal.fleet.dev/token";

/// Annotation carrying the generated admin password on an Instance
pub const PASSWORD_ANNOTATION: &str = "metal.fleet.dev/password";

/// Annotation carrying the iPXE script used when the device is reinstalled
pub const REINSTALL_IPXE_ANNOTATION: &str = "metal.fleet.dev/reconfig-ipxe-url";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "fleet-operator";
