//! Process-wide admission gate.
//!
//! Every command request takes a permit before doing any work. The gate holds
//! a single atomic counter of requests in flight; a request that would push it
//! past the ceiling is turned away with 429 and never spawns anything.

use crate::error::CommandError;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[derive(Debug)]
pub struct AdmissionGate {
    in_flight: AtomicUsize,
    ceiling: usize,
}

impl AdmissionGate {
    pub fn new(ceiling: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Atomically checks the ceiling and claims a slot.
    ///
    /// The returned permit gives the slot back when dropped, on every exit path.
    pub fn try_acquire(self: &Arc<Self>) -> Result<AdmissionPermit, CommandError> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.ceiling).then_some(n + 1)
            })
            .map(|_| AdmissionPermit {
                gate: Arc::clone(self),
            })
            .map_err(|in_flight| CommandError::AdmissionRejected {
                in_flight,
                ceiling: self.ceiling,
            })
    }
}

/// One claimed slot of the [`AdmissionGate`].
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
