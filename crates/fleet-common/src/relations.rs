//! Instance to InstancePool relation index
//!
//! The pool controller is re-triggered by Instance watch events. Rather than
//! scanning every Instance to find a pool's members, the index remembers the
//! owning pool, last seen phase and deleting flag of each Instance.
//!
//! The index only decides which pool to wake up. Reconcilers still list the
//! pool's Instances from the API server before acting on them.

use dashmap::DashMap;
use kube::ResourceExt;

use crate::crd::{Instance, InstancePhase};
use crate::POOL_LABEL;

/// What the index remembers about one Instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    /// Owning pool
    pub pool: String,
    /// Phase seen on the previous event
    pub phase: InstancePhase,
    /// Whether a deletion timestamp was seen
    pub deleting: bool,
}

/// Concurrent relation index between Instances and their pools
#[derive(Debug, Default)]
pub struct PoolIndex {
    members: DashMap<String, Membership>,
}

impl PoolIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a watch event for `instance` and return the pool to requeue, if any
    ///
    /// A pool is requeued when its Instance becomes Managed, when the Instance
    /// gains a deletion timestamp, and on every event of an Instance that is
    /// already being deleted (the final event of a removed object carries the
    /// timestamp too).
    pub fn observe(&self, instance: &Instance) -> Option<String> {
        let name = instance.name_any();
        let Some(pool) = owning_pool(instance) else {
            self.forget(&name);
            return None;
        };

        let current = Membership {
            pool: pool.clone(),
            phase: instance.phase(),
            deleting: instance.is_deleting(),
        };

        let previous = self.members.insert(name, current.clone());
        let moved = previous.as_ref().is_some_and(|p| p.pool != pool);

        let became_managed = current.phase == InstancePhase::Managed
            && (moved
                || previous
                    .as_ref()
                    .map_or(true, |p| p.phase != InstancePhase::Managed));

        (became_managed || current.deleting).then_some(pool)
    }

    /// Drop an Instance from the index and return the pool it belonged to
    pub fn forget(&self, instance: &str) -> Option<String> {
        self.members
            .remove(instance)
            .map(|(_, membership)| membership.pool)
    }
}

/// Owning pool of an Instance
///
/// The controller owner reference wins; the pool label is the fallback for
/// Instances created without one.
pub fn owning_pool(instance: &Instance) -> Option<String> {
    instance
        .owner_references()
        .iter()
        .find(|o| o.kind == "InstancePool" && o.controller.unwrap_or(false))
        .map(|o| o.name.clone())
        .or_else(|| instance.labels().get(POOL_LABEL).cloned())
}
