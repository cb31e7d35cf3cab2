//! Bounded field worker pool.
//!
//! Generalizes the single dequeue-loop idiom `rcommerce-core::jobs::worker`
//! uses for a single worker into an N-permit `tokio::sync::Semaphore` pool:
//! up to `workers` fields of one measurement run concurrently; per-field
//! work (chunk pagination) stays strictly sequential inside its own task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::model::WorkerUtilization;

/// Tracks concurrency and per-slot utilisation for one measurement's field
/// fan-out. Dropped and recreated per measurement so utilisation numbers
/// reset at a meaningful boundary.
pub struct FieldWorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    next_slot: AtomicUsize,
}

/// RAII guard returned by [`FieldWorkerPool::acquire`]; records utilisation
/// into the owning pool's slot on drop via `finish`.
pub struct WorkerSlot<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
    pub worker_index: usize,
    started: Instant,
}

impl<'a> WorkerSlot<'a> {
    pub fn finish(self, records: u64) -> WorkerUtilization {
        WorkerUtilization {
            worker_index: self.worker_index,
            fields_handled: 1,
            cumulative: self.started.elapsed(),
            records,
        }
    }
}

impl FieldWorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            next_slot: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquire a permit, blocking until one is free. The returned slot
    /// carries a worker index in `[0, size)` suitable for tagging log lines
    /// and utilisation records — indices are assigned round-robin and are
    /// not a strict identity (a permit may be reused by a different logical
    /// "thread slot" across acquisitions), which matches the pool's actual
    /// scheduling, not a fixed worker identity.
    pub async fn acquire(&self) -> WorkerSlot<'_> {
        let permit = self.semaphore.acquire().await.expect("semaphore not closed");
        let worker_index = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.size;
        WorkerSlot {
            _permit: permit,
            worker_index,
            started: Instant::now(),
        }
    }

    /// Snapshot of how many permits are currently checked out, for the
    /// "concurrency bound" testable property.
    pub fn active_count(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }
}
