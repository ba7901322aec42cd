//! Fleet sizing arithmetic
//!
//! Pure functions over observed Instances and the pool status. The
//! controller feeds them listed Instances and writes back what they return,
//! which keeps the convergence rules testable without an API server.

use std::cmp::Reverse;

use kube::ResourceExt;

use fleet_common::crd::{Instance, InstancePhase, InstancePoolStatus, PoolPhase};

/// Instances of a pool as seen by one pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Observed {
    /// Instances not being deleted
    pub present: i32,
    /// Present Instances whose Node has joined
    pub ready: i32,
}

/// Count the live and managed Instances among `instances`
pub fn observe(instances: &[Instance]) -> Observed {
    instances
        .iter()
        .filter(|i| !i.is_deleting())
        .fold(Observed::default(), |mut acc, i| {
            acc.present += 1;
            if i.phase() == InstancePhase::Managed {
                acc.ready += 1;
            }
            acc
        })
}

/// Status after comparing the observed fleet against `count`
///
/// The pool is ready only when every wanted Instance exists and is managed.
/// Otherwise `needed` becomes the signed gap and the phase follows its sign.
/// While shrinking, `requested` holds the present count so the cleanup pass
/// can count it down to `count`.
pub fn settle(count: i32, status: &InstancePoolStatus, observed: Observed) -> InstancePoolStatus {
    let mut next = status.clone();
    next.ready = observed.ready;

    if status.requested == count && observed.ready == count && observed.present == count {
        next.phase = PoolPhase::Ready;
        next.needed = 0;
        return next;
    }

    next.needed = count - observed.present;
    next.requested = if next.needed < 0 {
        observed.present
    } else {
        count
    };
    next.phase = match next.needed {
        n if n > 0 => PoolPhase::TokenReady,
        n if n < 0 => PoolPhase::CleanupNodes,
        _ => PoolPhase::Submitted,
    };
    next
}

/// How many Instances a submission pass may create
///
/// Bounded by both the recorded need and the real gap, so a stale `needed`
/// can never push the fleet above `count`.
pub fn creatable(count: i32, needed: i32, present: i32) -> i32 {
    needed.min(count - present).max(0)
}

/// Names of the Instances to delete to shed `excess`, newest first
///
/// Instances already being deleted are not candidates. Returns fewer names
/// than `excess` when candidates run out.
pub fn removal_candidates(instances: &[Instance], excess: i32) -> Vec<String> {
    let mut candidates: Vec<&Instance> = instances.iter().filter(|i| !i.is_deleting()).collect();
    candidates.sort_by_key(|i| {
        (
            Reverse(i.metadata.creation_timestamp.as_ref().map(|t| t.0)),
            Reverse(i.name_any()),
        )
    });
    candidates
        .into_iter()
        .take(excess.max(0) as usize)
        .map(|i| i.name_any())
        .collect()
}

/// Apply the deletions of a cleanup pass to the status
pub fn after_removals(status: &InstancePoolStatus, removed: i32) -> InstancePoolStatus {
    let mut next = status.clone();
    next.requested -= removed;
    next.needed += removed;
    next.phase = PoolPhase::Submitted;
    next
}
