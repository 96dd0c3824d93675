//! # Mipstream Cache
//!
//! Adaptive texture streaming cache for interactive renderers.
//!
//! For every texture referenced by visible surfaces the cache decides which
//! discard level to keep resident, fetches and decodes that level on worker
//! threads, promotes it to a GPU resource on the render thread, and evicts it
//! again under memory pressure.
//!
//! ## Components
//! - **Scorer**: screen footprint to virtual size and importance
//! - **Resource**: discard ladder, lifecycle state machine, boost tiers
//! - **Fetch pipeline**: transport then codec on a worker pool
//! - **Creation pipeline**: payload assembly off-thread, GPU upload on the render thread
//! - **Budget controller**: smoothed discard bias from aggregate GPU usage
//! - **Scheduler**: the registry and its bounded per-frame `tick`
//! - **Fast path**: pre-decoded snapshots for a first approximate appearance

pub mod backend;
pub mod budget;
pub mod config;
pub mod creation;
pub mod eviction;
pub mod fast_path;
pub mod fetch;
pub mod manifest;
pub mod references;
pub mod resource;
pub mod scheduler;
pub mod scorer;
pub mod sim;
pub mod stats;

pub use backend::{Codec, GpuDevice, GpuHandle, ImageSource, PixelFormat, RawImage, Transport, UploadImage};
pub use budget::BudgetController;
pub use config::{BudgetConfig, FastPathConfig, StreamingConfig};
pub use manifest::{Manifest, ManifestEntry};
pub use references::ConsumerId;
pub use resource::{BoostClass, FetchHint, ResourceState, TextureHandle, TextureResource};
pub use scheduler::{Scheduler, TickReport};
pub use scorer::{Footprint, PriorityScorer, Score, SurfaceFlags};
pub use stats::CacheStats;

pub use mipstream_core::TextureKey;

use thiserror::Error;

/// Streaming cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Texture not found: {0}")]
    NotFound(TextureKey),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Corrupt texture data: {0}")]
    Corrupt(String),

    #[error("Unsupported texture: {0}")]
    Unsupported(String),

    #[error("Out of texture budget: requested {requested} bytes with {used} of {target} in use")]
    OutOfBudget { requested: u64, used: u64, target: u64 },

    #[error("Operation already in flight for {0}")]
    AlreadyInFlight(TextureKey),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// How the resource state machine reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Mark the resource missing immediately
    Never,
    /// One automatic retry after backoff, then missing
    Once,
    /// Not a failure; try again on the next tick
    NextTick,
}

impl CacheError {
    /// Whether the failure describes the content itself rather than its delivery
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Corrupt(_) | Self::Unsupported(_) | Self::Config(_)
        )
    }

    /// Retry classification used by the fetch and creation paths
    ///
    /// Corrupt bytes get one retry because a truncated transfer looks the
    /// same as a bad asset until it has been fetched twice.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transient(_) | Self::Io(_) | Self::Corrupt(_) => RetryPolicy::Once,
            Self::OutOfBudget { .. } | Self::AlreadyInFlight(_) => RetryPolicy::NextTick,
            Self::NotFound(_) | Self::Unsupported(_) | Self::Config(_) | Self::Serialization(_) => {
                RetryPolicy::Never
            }
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let key = TextureKey::from_u128(7);
        assert_eq!(CacheError::NotFound(key).retry_policy(), RetryPolicy::Never);
        assert_eq!(CacheError::Transient("reset".into()).retry_policy(), RetryPolicy::Once);
        assert_eq!(CacheError::Corrupt("bad header".into()).retry_policy(), RetryPolicy::Once);
        assert_eq!(CacheError::Unsupported("8192px".into()).retry_policy(), RetryPolicy::Never);
        assert_eq!(
            CacheError::OutOfBudget { requested: 1, used: 2, target: 1 }.retry_policy(),
            RetryPolicy::NextTick
        );
    }

    #[test]
    fn test_permanence() {
        assert!(CacheError::NotFound(TextureKey::from_u128(1)).is_permanent());
        assert!(CacheError::Corrupt("x".into()).is_permanent());
        assert!(!CacheError::Transient("x".into()).is_permanent());
        assert!(!CacheError::OutOfBudget { requested: 0, used: 0, target: 0 }.is_permanent());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::NotFound(TextureKey::from_u128(1));
        assert_eq!(err.to_string(), "Texture not found: 00000000000000000000000000000001");
    }
}
