//! Instance controller for the bare-metal fleet operator
//!
//! Reconciles one `Instance` per machine against the provisioning backend and
//! watches Nodes so that cluster membership drives the last phases.

#![deny(missing_docs)]

pub mod controller;
pub mod correlation;

pub use controller::{error_policy, reconcile, Context, InstanceKube, InstanceKubeImpl};
pub use correlation::instance_for_node;
