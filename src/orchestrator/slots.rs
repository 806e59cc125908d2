//! Bounded admission of pipeline executions.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One unit of execution capacity. Dropping it returns the capacity.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyController {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking admission used by the dispatch phase. `None` leaves the run queued.
    pub fn try_acquire(&self) -> Option<Slot> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }

    pub fn release(&self, slot: Slot) {
        drop(slot);
    }
}
