//! Bounded worker pool.
//!
//! A long-lived semaphore owned by a process, scheduler or task manager.
//! Every unit of work holds a [`WorkerSlot`] while it runs; dropping the slot
//! returns the permit. In-flight and peak counters make the concurrency bound
//! observable.

use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Semaphore-gated pool of worker slots
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    gauge: Arc<Gauge>,
}

/// Permission to run one unit of work
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    gauge: Arc<Gauge>,
}

impl WorkerPool {
    /// Create a pool with `size` slots; a size of zero is raised to one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            gauge: Arc::new(Gauge::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<WorkerSlot> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        Ok(self.occupy(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.occupy(permit))
    }

    pub fn in_flight(&self) -> usize {
        self.gauge.in_flight.load(Ordering::SeqCst)
    }

    /// Highest simultaneous occupancy since creation or the last reset
    pub fn peak(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.gauge.peak.store(self.in_flight(), Ordering::SeqCst);
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop handing out slots; pending waiters receive an error
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn occupy(&self, permit: OwnedSemaphorePermit) -> WorkerSlot {
        let now = self.gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        WorkerSlot {
            _permit: permit,
            gauge: self.gauge.clone(),
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
