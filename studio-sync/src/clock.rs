//! Lamport clock for causal ordering of document writes.
//!
//! Every write carries a [`Stamp`]. Stamps are totally ordered by
//! `(counter, replica)`, so two replicas that saw the same set of writes
//! always pick the same winner for a key, regardless of arrival order.
//!
//! Reference: Lamport, "Time, Clocks, and the Ordering of Events" (1978)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A causal position: Lamport counter tie-broken by replica id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica: Uuid,
}

impl Stamp {
    pub fn new(counter: u64, replica: Uuid) -> Self {
        Self { counter, replica }
    }
}

/// Per-replica Lamport clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    replica: Uuid,
    counter: u64,
}

impl LamportClock {
    pub fn new(replica: Uuid) -> Self {
        Self { replica, counter: 0 }
    }

    /// Advance for a local write and return its stamp.
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.replica)
    }

    /// Fold in a stamp seen on a remote entry.
    pub fn observe(&mut self, stamp: Stamp) {
        if stamp.counter > self.counter {
            self.counter = stamp.counter;
        }
    }

    pub fn replica(&self) -> Uuid {
        self.replica
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}
