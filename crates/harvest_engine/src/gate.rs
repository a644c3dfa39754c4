use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("admission gate closed")]
pub struct GateClosed;

#[derive(Debug)]
struct GateState {
    capacity: usize,
    /// Permits still to be reclaimed from a shrink that found them checked
    /// out. Settled on the next resize as running tasks release them.
    deficit: usize,
}

/// Bounds how many item fetches run simultaneously, with a permit count
/// that can be adjusted in place while tasks hold permits.
///
/// Growing takes effect immediately. Shrinking removes idle permits first
/// and reclaims the remainder as they are released; until then the actual
/// parallelism may briefly exceed the new capacity. Callers resize on a
/// periodic cadence, which settles any outstanding reclamation.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    state: Arc<Mutex<GateState>>,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            state: Arc::new(Mutex::new(GateState {
                capacity,
                deficit: 0,
            })),
        }
    }

    /// Waits for an admission slot. The slot is released when the returned
    /// permit is dropped.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, GateClosed> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    /// Slots currently free to hand out.
    pub fn idle_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Adjusts the admitted parallelism in place.
    pub fn resize(&self, new_capacity: usize) {
        let mut state = self.state.lock().unwrap();

        // Settle reclamation owed from earlier shrinks before comparing.
        if state.deficit > 0 {
            state.deficit -= self.semaphore.forget_permits(state.deficit);
        }

        if new_capacity > state.capacity {
            let grow = new_capacity - state.capacity;
            let cancelled = grow.min(state.deficit);
            state.deficit -= cancelled;
            self.semaphore.add_permits(grow - cancelled);
        } else if new_capacity < state.capacity {
            let shrink = state.capacity - new_capacity;
            let removed = self.semaphore.forget_permits(shrink);
            state.deficit += shrink - removed;
        }
        state.capacity = new_capacity;
    }
}
