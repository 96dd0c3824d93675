//! Streaming Configuration
//!
//! Every tunable of the cache, loadable from JSON with per-field defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CacheError, CacheResult};

/// Largest discard level any ladder may use
pub const MAX_DISCARD_LEVEL: u8 = 12;

/// Longest grace period, retention or hold accepted, one week
pub const MAX_PERIOD_SECS: f32 = 7.0 * 24.0 * 3600.0;

/// Budget controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Explicit GPU memory ceiling; detected from the device when absent
    pub gpu_memory_ceiling_bytes: Option<u64>,
    /// Fraction of the ceiling the cache aims to use
    pub target_fraction: f32,
    /// Target never drops below this many bytes
    pub min_working_set_bytes: u64,
    /// Largest multiplicative change of the bias per observation
    pub max_bias_step: f32,
    /// Usage/target ratio at which eviction becomes immediate
    pub acute_pressure_ratio: f32,
    /// Upper clamp for the bias
    pub max_bias: f32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            gpu_memory_ceiling_bytes: None,
            target_fraction: 0.75,
            min_working_set_bytes: 64 * 1024 * 1024,
            max_bias_step: 1.25,
            acute_pressure_ratio: 1.5,
            max_bias: 8.0,
        }
    }
}

/// Fast-path snapshot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    /// Directory holding snapshot files
    pub dir: PathBuf,
    /// Largest edge written back as a snapshot
    pub max_snapshot_edge: u32,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("texture-snapshots"),
            max_snapshot_edge: 64,
        }
    }
}

/// Streaming cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Largest accepted texture edge in pixels
    pub max_texture_size: u32,
    /// Smallest edge any referenced surface may ask for
    pub min_virtual_edge: u32,
    /// Deepest discard level used for a ladder
    pub max_discard_level: u8,
    /// Level requested first when a texture's dimensions are still unknown
    pub initial_discard_level: u8,
    /// Resources re-scored per tick
    pub rescore_slice: usize,
    /// Resources visited by the eviction sweep per tick
    pub eviction_slice: usize,
    /// Fetches allowed in flight at once
    pub max_concurrent_fetches: usize,
    /// Fetch/decode worker threads; zero runs fetches inline
    pub fetch_workers: usize,
    /// Assemble GPU payloads on a dedicated worker thread
    pub threaded_creation: bool,
    /// Raw bytes handed to creation per tick
    pub max_creation_bytes_per_tick: u64,
    /// Fetches older than this fail as transient
    pub fetch_timeout_ms: u64,
    /// Delay before the automatic retry
    pub retry_backoff_ms: u64,
    /// Unreferenced time before a resource becomes an eviction candidate (G1)
    pub inactive_grace_secs: f32,
    /// Further time before a candidate is evicted (G2)
    pub candidate_grace_secs: f32,
    /// How long evicted tombstones stay queryable
    pub tombstone_retention_secs: f32,
    /// How long a manifest entry is kept queued without any reference
    pub manifest_hold_secs: f32,
    /// Edge of the checkerboard placeholder
    pub placeholder_size: u32,
    /// Budget controller settings
    pub budget: BudgetConfig,
    /// Snapshot loader settings; disabled when absent
    pub fast_path: Option<FastPathConfig>,
}

impl StreamingConfig {
    /// Settings for phones and tablets
    pub fn mobile() -> Self {
        Self {
            max_texture_size: 1024,
            min_virtual_edge: 8,
            max_discard_level: 5,
            initial_discard_level: 5,
            rescore_slice: 128,
            eviction_slice: 256,
            max_concurrent_fetches: 8,
            fetch_workers: 2,
            threaded_creation: true,
            max_creation_bytes_per_tick: 4 * 1024 * 1024,
            fetch_timeout_ms: 20_000,
            retry_backoff_ms: 1_000,
            inactive_grace_secs: 10.0,
            candidate_grace_secs: 10.0,
            tombstone_retention_secs: 30.0,
            manifest_hold_secs: 30.0,
            placeholder_size: 8,
            budget: BudgetConfig {
                min_working_set_bytes: 32 * 1024 * 1024,
                ..BudgetConfig::default()
            },
            fast_path: None,
        }
    }

    /// Settings for desktop GPUs
    pub fn desktop() -> Self {
        Self {
            max_texture_size: 2048,
            min_virtual_edge: 8,
            max_discard_level: 5,
            initial_discard_level: 5,
            rescore_slice: 512,
            eviction_slice: 1024,
            max_concurrent_fetches: 32,
            fetch_workers: 4,
            threaded_creation: true,
            max_creation_bytes_per_tick: 32 * 1024 * 1024,
            fetch_timeout_ms: 30_000,
            retry_backoff_ms: 500,
            inactive_grace_secs: 30.0,
            candidate_grace_secs: 30.0,
            tombstone_retention_secs: 60.0,
            manifest_hold_secs: 60.0,
            placeholder_size: 8,
            budget: BudgetConfig::default(),
            fast_path: None,
        }
    }

    /// Settings with inline workers, for deterministic tests and tools
    pub fn single_threaded() -> Self {
        Self {
            fetch_workers: 0,
            threaded_creation: false,
            ..Self::desktop()
        }
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> CacheResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty JSON
    pub fn to_json_string(&self) -> CacheResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_texture_size == 0 || !self.max_texture_size.is_power_of_two() {
            return Err(CacheError::Config(format!(
                "max_texture_size must be a power of two, got {}",
                self.max_texture_size
            )));
        }
        if self.min_virtual_edge == 0 || self.min_virtual_edge > self.max_texture_size {
            return Err(CacheError::Config(format!(
                "min_virtual_edge must be in 1..={}",
                self.max_texture_size
            )));
        }
        if self.max_discard_level > MAX_DISCARD_LEVEL {
            return Err(CacheError::Config(format!(
                "max_discard_level must be at most {}",
                MAX_DISCARD_LEVEL
            )));
        }
        if self.initial_discard_level > self.max_discard_level {
            return Err(CacheError::Config(
                "initial_discard_level cannot exceed max_discard_level".to_string(),
            ));
        }
        if self.rescore_slice == 0 || self.eviction_slice == 0 {
            return Err(CacheError::Config("slice sizes must be non-zero".to_string()));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(CacheError::Config(
                "max_concurrent_fetches must be non-zero".to_string(),
            ));
        }
        period("inactive_grace_secs", self.inactive_grace_secs)?;
        period("candidate_grace_secs", self.candidate_grace_secs)?;
        period("tombstone_retention_secs", self.tombstone_retention_secs)?;
        period("manifest_hold_secs", self.manifest_hold_secs)?;
        let max_millis = (MAX_PERIOD_SECS as u64) * 1000;
        if self.fetch_timeout_ms > max_millis || self.retry_backoff_ms > max_millis {
            return Err(CacheError::Config(format!(
                "fetch_timeout_ms and retry_backoff_ms must be at most {}",
                max_millis
            )));
        }
        if self.placeholder_size == 0
            || !self.placeholder_size.is_power_of_two()
            || self.placeholder_size > self.max_texture_size
        {
            return Err(CacheError::Config(format!(
                "placeholder_size must be a power of two no larger than {}",
                self.max_texture_size
            )));
        }

        let budget = &self.budget;
        if !(budget.target_fraction > 0.0 && budget.target_fraction <= 1.0) {
            return Err(CacheError::Config("target_fraction must be in (0, 1]".to_string()));
        }
        if !(budget.max_bias_step.is_finite() && budget.max_bias_step > 1.0) {
            return Err(CacheError::Config("max_bias_step must exceed 1".to_string()));
        }
        if !(budget.max_bias.is_finite() && budget.max_bias >= 1.0)
            || !(budget.acute_pressure_ratio.is_finite() && budget.acute_pressure_ratio >= 1.0)
        {
            return Err(CacheError::Config(
                "max_bias and acute_pressure_ratio must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Fetch timeout as a duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Retry backoff as a duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// First eviction grace period (G1)
    pub fn inactive_grace(&self) -> Duration {
        clamped_period(self.inactive_grace_secs)
    }

    /// Second eviction grace period (G2)
    pub fn candidate_grace(&self) -> Duration {
        clamped_period(self.candidate_grace_secs)
    }

    /// Tombstone retention as a duration
    pub fn tombstone_retention(&self) -> Duration {
        clamped_period(self.tombstone_retention_secs)
    }

    /// Hold on manifest entries as a duration
    pub fn manifest_hold(&self) -> Duration {
        clamped_period(self.manifest_hold_secs)
    }

    /// Largest virtual size (pixel area) the scorer may report
    pub fn max_virtual_size(&self) -> f32 {
        let edge = self.max_texture_size as f32;
        edge * edge
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::desktop()
    }
}

/// Check one period setting and convert it
fn period(name: &str, secs: f32) -> CacheResult<Duration> {
    if !secs.is_finite() || !(0.0..=MAX_PERIOD_SECS).contains(&secs) {
        return Err(CacheError::Config(format!(
            "{} must be in 0..={}, got {}",
            name, MAX_PERIOD_SECS, secs
        )));
    }
    Duration::try_from_secs_f32(secs)
        .map_err(|err| CacheError::Config(format!("{}: {}", name, err)))
}

/// Infallible conversion for settings that skipped validation
fn clamped_period(secs: f32) -> Duration {
    if secs.is_finite() {
        Duration::from_secs_f32(secs.clamp(0.0, MAX_PERIOD_SECS))
    } else {
        Duration::ZERO
    }
}
