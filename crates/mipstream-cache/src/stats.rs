//! Cache Statistics

use mipstream_core::memory::MIB;

use crate::resource::ResourceState;

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub total: usize,
    pub unrequested: usize,
    pub fetching: usize,
    pub decoding: usize,
    pub pending_creation: usize,
    pub resident: usize,
    pub inactive: usize,
    pub eviction_candidates: usize,
    pub evicted: usize,
    pub missing: usize,
    pub gpu_bytes: u64,
    pub peak_gpu_bytes: u64,
    pub target_bytes: u64,
    /// Bytes held by resident payloads; differs from `gpu_bytes` by the placeholder
    pub resident_bytes: u64,
    pub over_budget: bool,
    pub budget_observations: u64,
    pub discard_bias: f32,
    pub fetches_in_flight: usize,
    pub creations_outstanding: usize,
    pub fetches_issued: u64,
    pub fetches_failed: u64,
    pub creations: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Count one resource in its state bucket
    pub fn count_state(&mut self, state: ResourceState) {
        self.total += 1;
        match state {
            ResourceState::Unrequested => self.unrequested += 1,
            ResourceState::Fetching => self.fetching += 1,
            ResourceState::Decoding => self.decoding += 1,
            ResourceState::PendingCreation => self.pending_creation += 1,
            ResourceState::Resident => self.resident += 1,
            ResourceState::Inactive => self.inactive += 1,
            ResourceState::EvictionCandidate => self.eviction_candidates += 1,
            ResourceState::Evicted => self.evicted += 1,
        }
    }

    /// Resources in a given state
    pub fn in_state(&self, state: ResourceState) -> usize {
        match state {
            ResourceState::Unrequested => self.unrequested,
            ResourceState::Fetching => self.fetching,
            ResourceState::Decoding => self.decoding,
            ResourceState::PendingCreation => self.pending_creation,
            ResourceState::Resident => self.resident,
            ResourceState::Inactive => self.inactive,
            ResourceState::EvictionCandidate => self.eviction_candidates,
            ResourceState::Evicted => self.evicted,
        }
    }

    /// GPU usage divided by the target
    pub fn usage_ratio(&self) -> f64 {
        if self.target_bytes == 0 {
            return 0.0;
        }
        self.gpu_bytes as f64 / self.target_bytes as f64
    }

    /// Write a summary to the log
    pub fn log_summary(&self) {
        log::info!("=== Texture Cache ===");
        log::info!(
            "GPU: {:.1} MiB / {:.1} MiB target (peak {:.1} MiB), bias {:.2}",
            self.gpu_bytes as f64 / MIB,
            self.target_bytes as f64 / MIB,
            self.peak_gpu_bytes as f64 / MIB,
            self.discard_bias
        );
        log::info!(
            "Resources: {} total, {} resident, {} in flight, {} pending creation, {} missing",
            self.total,
            self.resident,
            self.fetching + self.decoding,
            self.pending_creation,
            self.missing
        );
        log::info!(
            "Lifecycle: {} inactive, {} candidates, {} evicted",
            self.inactive,
            self.eviction_candidates,
            self.evicted
        );
        log::info!(
            "Totals: {} fetches ({} failed), {} creations, {} evictions",
            self.fetches_issued,
            self.fetches_failed,
            self.creations,
            self.evictions
        );

        if self.over_budget {
            log::warn!(
                "Texture memory over target by {:.1} MiB after {} budget observations",
                self.gpu_bytes.saturating_sub(self.target_bytes) as f64 / MIB,
                self.budget_observations
            );
        }
    }
}
