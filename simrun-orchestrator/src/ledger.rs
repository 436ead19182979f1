//! Resource Ledger
//!
//! Tracks execution slots committed to running jobs against a capacity fixed
//! at startup. Reservation is all-or-nothing and never lets `committed`
//! exceed `total_capacity`.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct ResourceLedger {
    total_capacity: u32,
    committed: AtomicU32,
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub total_capacity: u32,
    pub committed: u32,
}

impl LedgerSnapshot {
    pub fn available(&self) -> u32 {
        self.total_capacity - self.committed
    }
}

impl ResourceLedger {
    pub fn new(total_capacity: u32) -> Self {
        Self {
            total_capacity,
            committed: AtomicU32::new(0),
        }
    }

    pub fn total_capacity(&self) -> u32 {
        self.total_capacity
    }

    pub fn committed(&self) -> u32 {
        self.committed.load(Ordering::Acquire)
    }

    /// Whether a request could ever be satisfied by this ledger
    pub fn fits(&self, slots: u32) -> bool {
        slots <= self.total_capacity
    }

    /// Commits `slots` if they fit under the capacity, atomically
    pub fn try_reserve(&self, slots: u32) -> bool {
        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                committed
                    .checked_add(slots)
                    .filter(|next| *next <= self.total_capacity)
            })
            .is_ok()
    }

    /// Returns `slots` to the pool; never drops below zero
    pub fn release(&self, slots: u32) {
        let previous = self
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                Some(committed.saturating_sub(slots))
            })
            .unwrap_or_else(|current| current);

        if previous < slots {
            tracing::warn!(
                released = slots,
                committed = previous,
                "Released more slots than were committed"
            );
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_capacity: self.total_capacity,
            committed: self.committed(),
        }
    }
}
