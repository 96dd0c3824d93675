//! Budget Controller
//!
//! Feedback loop from aggregate GPU usage to a global discard bias.

use mipstream_core::memory::MIB;

use crate::config::BudgetConfig;

/// Ceiling assumed when neither configuration nor device reports one
pub const FALLBACK_CEILING_BYTES: u64 = 512 * 1024 * 1024;

/// Smoothed discard bias derived from GPU memory usage
#[derive(Debug, Clone)]
pub struct BudgetController {
    config: BudgetConfig,
    ceiling: u64,
    target: u64,
    bias: f32,
    last_used: u64,
    observations: u64,
}

impl BudgetController {
    /// Create a new controller
    ///
    /// The configured ceiling wins over the detected one; without either the
    /// controller falls back to 512 MiB.
    pub fn new(config: BudgetConfig, detected_ceiling: Option<u64>) -> Self {
        let ceiling = config
            .gpu_memory_ceiling_bytes
            .or(detected_ceiling)
            .unwrap_or(FALLBACK_CEILING_BYTES)
            .max(1);
        let target = ((ceiling as f64 * config.target_fraction as f64) as u64)
            .max(config.min_working_set_bytes)
            .max(1);

        log::debug!(
            "Texture budget: ceiling {:.1} MiB, target {:.1} MiB",
            ceiling as f64 / MIB,
            target as f64 / MIB
        );

        Self {
            config,
            ceiling,
            target,
            bias: 1.0,
            last_used: 0,
            observations: 0,
        }
    }

    /// Feed the current usage and get the new bias
    ///
    /// The bias moves toward `used / target` by at most `max_bias_step`
    /// (multiplicatively) per call.
    pub fn observe(&mut self, used: u64) -> f32 {
        self.last_used = used;
        self.observations += 1;

        let raw = (self.usage_ratio() as f32).max(1.0);
        let step = self.config.max_bias_step.max(1.0);
        let lower = self.bias / step;
        let upper = self.bias * step;
        let next = raw.clamp(lower, upper).clamp(1.0, self.config.max_bias.max(1.0));

        if (next - self.bias).abs() > 0.05 {
            log::debug!(
                "Discard bias {:.2} -> {:.2} ({:.1} of {:.1} MiB)",
                self.bias,
                next,
                used as f64 / MIB,
                self.target as f64 / MIB
            );
        }
        self.bias = next;
        next
    }

    /// Current discard bias, at least 1
    pub fn bias(&self) -> f32 {
        self.bias
    }

    /// Whether usage is far enough over target to evict immediately
    pub fn acute_pressure(&self) -> bool {
        self.usage_ratio() >= self.config.acute_pressure_ratio as f64
    }

    /// Whether the last observation exceeded the target
    pub fn over_budget(&self) -> bool {
        self.last_used > self.target
    }

    /// Divisor applied to eviction grace periods
    pub fn grace_scale(&self) -> f32 {
        self.bias
    }

    /// Usage divided by target at the last observation
    pub fn usage_ratio(&self) -> f64 {
        self.last_used as f64 / self.target as f64
    }

    /// Effective ceiling in bytes
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Target working set in bytes
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Bytes in use at the last observation
    pub fn last_used(&self) -> u64 {
        self.last_used
    }

    /// Number of observations so far
    pub fn observations(&self) -> u64 {
        self.observations
    }
}
