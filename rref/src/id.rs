//! Identifiers of remote references and their forks.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::WorkerId;

/// An id that is unique across the cluster.
///
/// Consists of the id of the worker that created it and a counter value
/// local to that worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GloballyUniqueId {
    /// Worker that generated this id.
    pub created_on: WorkerId,
    /// Value of the generating worker's counter.
    pub local_id: u64,
}

impl GloballyUniqueId {
    /// Creates an id from its parts.
    pub const fn new(created_on: WorkerId, local_id: u64) -> Self {
        Self { created_on, local_id }
    }
}

impl fmt::Display for GloballyUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GloballyUniqueId({}, {})", self.created_on, self.local_id)
    }
}

/// Identifies the value referenced by an RRef.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RRefId(pub GloballyUniqueId);

/// Identifies one specific copy of an RRef held by some worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(pub GloballyUniqueId);

impl fmt::Display for RRefId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RRefId({}, {})", self.0.created_on, self.0.local_id)
    }
}

impl fmt::Display for ForkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ForkId({}, {})", self.0.created_on, self.0.local_id)
    }
}

/// Generates globally unique ids for one worker.
#[derive(Debug)]
pub struct IdGenerator {
    worker: WorkerId,
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator for the specified worker.
    pub fn new(worker: WorkerId) -> Self {
        Self { worker, next: AtomicU64::new(0) }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> GloballyUniqueId {
        GloballyUniqueId::new(self.worker, self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a new RRef id.
    pub fn rref_id(&self) -> RRefId {
        RRefId(self.next_id())
    }

    /// Returns a new fork id.
    pub fn fork_id(&self) -> ForkId {
        ForkId(self.next_id())
    }
}
