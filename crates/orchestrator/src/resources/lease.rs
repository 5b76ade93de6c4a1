//! Exclusive leasing of pool resources.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use provision_core::ResourceSpec;
use tracing::debug;

/// Fixed, ordered pool of exclusive resources.
///
/// `locked` holds the indices currently leased. It is the only mutable
/// state and is guarded by a single mutex, so an index can never be held by
/// two leases at once.
#[derive(Debug)]
pub struct ResourcePool {
    resources: Vec<ResourceSpec>,
    locked: Mutex<BTreeSet<usize>>,
}

impl ResourcePool {
    pub fn new(resources: Vec<ResourceSpec>) -> Arc<Self> {
        Arc::new(Self {
            resources,
            locked: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ResourceSpec> {
        self.resources.get(index)
    }

    /// Lease the lowest free index, or `None` when every resource is held.
    pub fn claim(self: &Arc<Self>) -> Option<ResourceLease> {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        let index = (0..self.resources.len()).find(|i| !locked.contains(i))?;
        locked.insert(index);
        drop(locked);

        debug!(resource = index, "Resource leased");
        Some(ResourceLease {
            pool: Arc::clone(self),
            index,
        })
    }

    fn release(&self, index: usize) {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
        debug!(resource = index, "Resource released");
    }

    pub fn is_locked(&self, index: usize) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&index)
    }

    pub fn locked_count(&self) -> usize {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive hold on one pool resource.
///
/// The index is released when the lease is dropped, so every exit path
/// (early return, error, panic unwinding) gives the resource back exactly
/// once.
#[derive(Debug)]
pub struct ResourceLease {
    pool: Arc<ResourcePool>,
    index: usize,
}

impl ResourceLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.pool.resources[self.index]
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
