//! Eviction Policy
//!
//! Two-stage grace periods for unreferenced textures, shortened by the
//! discard bias, plus the round-robin cursor the scheduler uses to walk its
//! registry in bounded slices.

use std::time::{Duration, Instant};

use crate::config::StreamingConfig;
use crate::resource::{Lifecycle, TextureResource};

/// Next lifecycle step for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionStep {
    Keep,
    /// Nothing references it any more
    Deactivate,
    /// First grace period elapsed
    Promote,
    /// Release everything and leave a tombstone
    Evict,
}

/// Grace periods G1 and G2
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    inactive_grace: Duration,
    candidate_grace: Duration,
}

impl EvictionPolicy {
    /// Create a new policy
    pub fn new(inactive_grace: Duration, candidate_grace: Duration) -> Self {
        Self {
            inactive_grace,
            candidate_grace,
        }
    }

    /// Policy from configuration
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.inactive_grace(), config.candidate_grace())
    }

    /// Grace before an inactive resource becomes a candidate
    pub fn inactive_grace(&self, scale: f32) -> Duration {
        scaled(self.inactive_grace, scale)
    }

    /// Total unreferenced time before eviction
    pub fn eviction_grace(&self, scale: f32) -> Duration {
        scaled(self.inactive_grace + self.candidate_grace, scale)
    }

    /// Decide the next step for `resource`
    ///
    /// A referenced resource always gets [`EvictionStep::Keep`], and so does
    /// one under a live manifest hold unless its content is missing.
    pub fn evaluate(
        &self,
        resource: &TextureResource,
        referenced: bool,
        now: Instant,
        grace_scale: f32,
        acute_pressure: bool,
    ) -> EvictionStep {
        if referenced || resource.is_evicted() || resource.boost_class().exempt_from_eviction() {
            return EvictionStep::Keep;
        }
        if resource.is_missing() {
            return EvictionStep::Evict;
        }
        if resource.is_held(now) {
            return EvictionStep::Keep;
        }

        let unreferenced_for = now.saturating_duration_since(resource.last_touched());
        match resource.lifecycle {
            Lifecycle::Active => EvictionStep::Deactivate,
            Lifecycle::Inactive if unreferenced_for >= self.inactive_grace(grace_scale) => {
                EvictionStep::Promote
            }
            Lifecycle::Candidate
                if acute_pressure || unreferenced_for >= self.eviction_grace(grace_scale) =>
            {
                EvictionStep::Evict
            }
            _ => EvictionStep::Keep,
        }
    }
}

fn scaled(grace: Duration, scale: f32) -> Duration {
    let scale = if scale.is_finite() { scale.max(1.0) } else { 1.0 };
    grace.div_f32(scale)
}

/// Cursor walking `0..len` in fixed-size slices, wrapping around
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    /// Create a new cursor at the start
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `count` indices of a collection of `len` items
    ///
    /// Every index is visited once within `ceil(len / count)` calls as long
    /// as the collection does not change.
    pub fn next_slice(&mut self, len: usize, count: usize) -> Vec<usize> {
        if len == 0 || count == 0 {
            return Vec::new();
        }
        let start = self.cursor % len;
        let count = count.min(len);
        self.cursor = (start + count) % len;
        (0..count).map(|i| (start + i) % len).collect()
    }

    /// Current position
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
