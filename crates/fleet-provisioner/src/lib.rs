//! Client for the metal provisioning backend
//!
//! Layers, bottom up:
//! - [`types`]: wire model of devices, ports and requests
//! - [`api`]: one call per REST endpoint ([`MetalApi`], [`MetalClient`])
//! - [`topology`]: planning of network topology conversions
//! - [`provisioner`]: the operations the Instance controller performs
//!   ([`Provisioner`], [`MetalProvisioner`])

#![deny(missing_docs)]

pub mod api;
pub mod error;
pub mod provisioner;
pub mod topology;
pub mod types;

pub use api::{MetalApi, MetalClient};
pub use error::ProvisionerError;
pub use provisioner::{DeviceStatus, MetalProvisioner, Provisioner};
pub use types::DeviceState;
