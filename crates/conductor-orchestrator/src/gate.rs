use conductor_core::{ConductorError, ConductorResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of simultaneously running workers.
///
/// Slots are handed out by a FIFO-fair semaphore. A [`SlotHandle`] gives its
/// slot back when released or dropped, so an early return can never leak one.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_use: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

/// One occupied slot.
#[derive(Debug)]
pub struct SlotHandle {
    _permit: OwnedSemaphorePermit,
    in_use: Arc<AtomicUsize>,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    /// Gate with `capacity` slots. Zero is rejected.
    pub fn new(capacity: usize) -> ConductorResult<Self> {
        if capacity == 0 {
            return Err(ConductorError::Config(
                "concurrency gate capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_use: Arc::new(AtomicUsize::new(0)),
            high_water: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> ConductorResult<SlotHandle> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConductorError::Config("concurrency gate closed".into()))?;
        Ok(self.occupy(permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotHandle> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.occupy(permit))
    }

    fn occupy(&self, permit: OwnedSemaphorePermit) -> SlotHandle {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        SlotHandle {
            _permit: permit,
            in_use: self.in_use.clone(),
        }
    }

    /// Give a slot back.
    pub fn release(&self, handle: SlotHandle) {
        drop(handle);
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Most slots ever held at once.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}
