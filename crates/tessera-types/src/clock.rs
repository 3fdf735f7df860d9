//! Logical clock and write stamps for last-writer-wins conflict resolution.
//!
//! Every mutation of a node or edge carries a [`Stamp`]. Stamps are totally
//! ordered: `revision` first, then the writer's [`ReplicaId`]. Because replica
//! IDs are UUIDv7, the tie-break falls back to the creation order of the
//! replica that made the write.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ids::ReplicaId;

/// Totally ordered write stamp.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Logical clock value at the time of the write.
    pub revision: u64,
    /// Replica that performed the write.
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(revision: u64, replica: ReplicaId) -> Self {
        Self { revision, replica }
    }

    /// The smallest possible stamp. Anything beats it.
    pub fn zero() -> Self {
        Self {
            revision: 0,
            replica: ReplicaId::nil(),
        }
    }
}

impl Default for Stamp {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.revision
            .cmp(&other.revision)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stamp({}@{})", self.revision, self.replica.short())
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}@{}", self.revision, self.replica.short())
    }
}

/// Lamport clock owned by one replica.
///
/// `tick()` hands out strictly increasing revisions; `observe()` folds in
/// revisions seen from remote state so later local writes outrank them.
#[derive(Debug)]
pub struct LamportClock {
    replica: ReplicaId,
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            counter: AtomicU64::new(0),
        }
    }

    /// Resume a clock at a previously observed revision.
    pub fn starting_at(replica: ReplicaId, revision: u64) -> Self {
        Self {
            replica,
            counter: AtomicU64::new(revision),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Current revision without advancing.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Advance and return a fresh stamp.
    pub fn tick(&self) -> Stamp {
        let revision = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Stamp::new(revision, self.replica)
    }

    /// Fresh stamp that also outranks `floor` (the entity's current revision).
    pub fn tick_above(&self, floor: u64) -> Stamp {
        self.observe(floor);
        self.tick()
    }

    /// Fold in a revision seen elsewhere.
    pub fn observe(&self, revision: u64) {
        self.counter.fetch_max(revision, Ordering::SeqCst);
    }
}

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
