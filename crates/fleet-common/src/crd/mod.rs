//! Custom Resource Definitions for the fleet operator
//!
//! Both kinds are cluster-scoped and live in the `metal.fleet.dev` group.

mod instance;
mod instance_pool;
mod types;

pub use instance::{Instance, InstancePhase, InstanceSpec, InstanceStatus};
pub use instance_pool::{InstancePool, InstancePoolSpec, InstancePoolStatus, PoolPhase};
pub use types::{InterfaceConfiguration, NetworkType, NetworkingConfiguration};
