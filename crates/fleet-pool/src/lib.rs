//! InstancePool reconciliation
//!
//! Sizes a fleet of Instances to the pool's `count`: join material is
//! resolved once, missing Instances are synthesized from the pool template
//! and surplus ones are removed newest first.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod controller;
pub mod locks;
pub mod sizing;

pub use controller::{error_policy, reconcile, Context, PoolKube, PoolKubeImpl};
pub use locks::SubmissionLocks;
