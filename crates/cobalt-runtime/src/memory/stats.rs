//! Memory statistics and monitoring

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a device memory pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub device_id: u32,
    pub limit_bytes: u64,
    pub current_usage_bytes: u64,
    pub peak_usage_bytes: u64,
    /// Live buffers and reservations
    pub active_allocations: u64,
    /// Allocation requests that succeeded (lifetime)
    pub allocation_count: u64,
    pub deallocation_count: u64,
    /// Allocation requests refused for lack of budget or host memory
    pub allocation_failures: u64,
}

impl MemoryStats {
    pub fn available_bytes(&self) -> u64 {
        self.limit_bytes.saturating_sub(self.current_usage_bytes)
    }

    pub fn utilization(&self) -> f32 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        self.current_usage_bytes as f32 / self.limit_bytes as f32
    }
}

/// Lock-free counters behind a pool
#[derive(Debug, Default)]
pub(crate) struct MemoryStatsTracker {
    current_usage: AtomicU64,
    peak_usage: AtomicU64,
    active_allocations: AtomicU64,
    allocation_count: AtomicU64,
    deallocation_count: AtomicU64,
    allocation_failures: AtomicU64,
}

impl MemoryStatsTracker {
    /// Claim `size` bytes if they fit under `limit`.
    pub(crate) fn try_claim(&self, size: u64, limit: u64) -> bool {
        let mut current = self.current_usage.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= limit => next,
                _ => {
                    self.allocation_failures.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            };
            match self.current_usage.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.record_allocation(next);
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn record_allocation(&self, new_usage: u64) {
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.active_allocations.fetch_add(1, Ordering::Relaxed);

        let mut peak = self.peak_usage.load(Ordering::Relaxed);
        while new_usage > peak {
            match self.peak_usage.compare_exchange_weak(
                peak,
                new_usage,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current_peak) => peak = current_peak,
            }
        }
    }

    /// Undo a claim whose backing storage could not be created.
    pub(crate) fn rollback(&self, size: u64) {
        self.current_usage.fetch_sub(size, Ordering::AcqRel);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.active_allocations.fetch_sub(1, Ordering::Relaxed);
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self, size: u64) {
        self.current_usage.fetch_sub(size, Ordering::AcqRel);
        self.active_allocations.fetch_sub(1, Ordering::Relaxed);
        self.deallocation_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn current_usage(&self) -> u64 {
        self.current_usage.load(Ordering::Acquire)
    }

    pub(crate) fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self, device_id: u32, limit_bytes: u64) -> MemoryStats {
        MemoryStats {
            device_id,
            limit_bytes,
            current_usage_bytes: self.current_usage.load(Ordering::Acquire),
            peak_usage_bytes: self.peak_usage.load(Ordering::Relaxed),
            active_allocations: self.active_allocations.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            deallocation_count: self.deallocation_count.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
        }
    }
}
