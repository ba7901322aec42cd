//! Per-pool submission locks
//!
//! Growing a pool lists its Instances and then creates the missing ones. Two
//! passes doing that at once for the same pool would both see the same gap,
//! so submissions take the pool's lock. Different pools never contend.
//!
//! A pool's entry lives only while someone holds or waits for its lock, so
//! deleted pools leave nothing behind.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of pool name to its submission mutex
#[derive(Debug, Default)]
pub struct SubmissionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held submission lock of one pool
///
/// Dropping the last guard of a pool removes the pool's entry.
#[derive(Debug)]
pub struct SubmissionGuard<'a> {
    locks: &'a SubmissionLocks,
    pool: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Waiters hold a clone of the Arc, so a count of one means idle
        self.locks
            .locks
            .remove_if(&self.pool, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SubmissionLocks {
    /// Create an empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and hold the submission lock of `pool`
    pub async fn acquire(&self, pool: &str) -> SubmissionGuard<'_> {
        let lock = self
            .locks
            .entry(pool.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        SubmissionGuard {
            locks: self,
            pool: pool.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of pools with a held or awaited lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no pool has a held or awaited lock
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
