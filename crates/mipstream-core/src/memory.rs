//! Memory Accounting
//!
//! Lock-free byte counters for GPU-resident texture payloads.
//! The creation side records allocations and frees; the budget side reads
//! the aggregate from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes per mebibyte, used for human-readable reports
pub const MIB: f64 = 1024.0 * 1024.0;

/// Memory tracking statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Bytes currently allocated
    allocated: AtomicU64,
    /// Peak bytes allocated
    peak: AtomicU64,
    /// Number of allocations recorded
    allocation_count: AtomicU64,
    /// Number of frees recorded
    free_count: AtomicU64,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, bytes: u64) {
        let new_size = self.allocated.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        let mut peak = self.peak.load(Ordering::Relaxed);
        while new_size > peak {
            match self.peak.compare_exchange_weak(
                peak,
                new_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    /// Record a deallocation
    ///
    /// Saturates at zero.
    pub fn record_dealloc(&self, bytes: u64) {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.free_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current allocated bytes
    pub fn current(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Get peak allocated bytes
    pub fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get total allocation count
    pub fn count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Get total free count
    pub fn free_count(&self) -> u64 {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Number of allocations not yet freed
    pub fn live_allocations(&self) -> u64 {
        self.count().saturating_sub(self.free_count())
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
        self.allocation_count.store(0, Ordering::Relaxed);
        self.free_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_stats() {
        let stats = MemoryStats::new();

        stats.record_alloc(100);
        stats.record_alloc(200);

        assert_eq!(stats.current(), 300);
        assert_eq!(stats.peak_usage(), 300);
        assert_eq!(stats.count(), 2);

        stats.record_dealloc(100);

        assert_eq!(stats.current(), 200);
        assert_eq!(stats.peak_usage(), 300); // Peak unchanged
        assert_eq!(stats.live_allocations(), 1);
    }

    #[test]
    fn test_dealloc_saturates() {
        let stats = MemoryStats::new();
        stats.record_alloc(10);
        stats.record_dealloc(50);
        assert_eq!(stats.current(), 0);

        stats.reset();
        assert_eq!(stats.peak_usage(), 0);
        assert_eq!(stats.free_count(), 0);
    }

    #[test]
    fn test_concurrent_accounting() {
        let stats = Arc::new(MemoryStats::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_alloc(4);
                        stats.record_dealloc(4);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.current(), 0);
        assert_eq!(stats.count(), 4000);
        assert!(stats.peak_usage() >= 4);
    }
}
