//! # Mipstream Core
//!
//! Foundational primitives shared by the mipstream texture streaming cache.
//!
//! This crate provides:
//! - **Keys**: 128-bit content keys identifying streamed textures
//! - **Memory**: Atomic byte accounting for GPU-resident payloads
//! - **Time**: Injectable clocks and stopwatches for grace periods and frame budgets
//! - **Threading**: Named worker pool for fetch, decode and assembly work
//! - **Math**: Power-of-two and discard-ladder helpers

pub mod math;
pub mod memory;
pub mod threading;
pub mod time;

pub use memory::MemoryStats;
pub use threading::WorkerPool;
pub use time::{Clock, ManualClock, ScopedTimer, Stopwatch, SystemClock};

use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable 128-bit content key for a streamed texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey(pub u128);

impl TextureKey {
    /// Create a key from a raw 128-bit value
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Derive a key from content bytes
    ///
    /// Two independently seeded 64-bit hashes fill the high and low halves,
    /// so the result is stable across runs and processes.
    pub fn from_content(content: &[u8]) -> Self {
        let high = Self::seeded_hash(content, 0x6d69_7073_7472_6561);
        let low = Self::seeded_hash(content, 0x7465_7874_7572_6573);
        Self(((high as u128) << 64) | low as u128)
    }

    fn seeded_hash(content: &[u8], seed: u64) -> u64 {
        let state = ahash::RandomState::with_seeds(seed, seed.rotate_left(17), seed ^ 0x9e37_79b9, !seed);
        let mut hasher = state.build_hasher();
        hasher.write(content);
        hasher.finish()
    }

    /// Get the raw key value
    pub fn value(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for TextureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Error returned when parsing a [`TextureKey`] from text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyError(String);

impl fmt::Display for ParseKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid texture key '{}'", self.0)
    }
}

impl std::error::Error for ParseKeyError {}

impl FromStr for TextureKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0x");
        if trimmed.is_empty() || trimmed.len() > 32 {
            return Err(ParseKeyError(s.to_string()));
        }
        u128::from_str_radix(trimmed, 16)
            .map(Self)
            .map_err(|_| ParseKeyError(s.to_string()))
    }
}

impl Serialize for TextureKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TextureKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
