//! Priority Scorer
//!
//! Pure functions turning a surface's screen footprint into the resolution
//! its texture needs (virtual size, in pixels) and an importance weight, and
//! turning a virtual size into a discard level under the current bias.

use bitflags::bitflags;
use glam::Vec2;
use mipstream_core::math::{clamp01, next_power_of_two_f32};

use crate::config::StreamingConfig;
use crate::resource::{BoostClass, DiscardLadder};

bitflags! {
    /// Surface properties that raise importance
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SurfaceFlags: u8 {
        const ANIMATED = 1 << 0;
        const PARTICLE = 1 << 1;
        const UI = 1 << 2;
        const SELECTED = 1 << 3;
    }
}

/// Per-frame report from a surface about how it appears on screen
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Footprint {
    /// Projected area in screen pixels
    pub screen_area: f32,
    /// Texture-coordinate repeat of the surface
    pub texcoord_scale: Vec2,
    /// Unoccluded share of the surface, 0..1
    pub visible_fraction: f32,
    /// Distance from the camera in world units
    pub distance: f32,
    pub flags: SurfaceFlags,
}

impl Footprint {
    /// Fully visible surface at unit texture scale
    pub fn new(screen_area: f32, distance: f32) -> Self {
        Self {
            screen_area,
            texcoord_scale: Vec2::ONE,
            visible_fraction: 1.0,
            distance,
            flags: SurfaceFlags::empty(),
        }
    }

    /// Surface covering a square of `edge` pixels
    pub fn square(edge: f32) -> Self {
        Self::new(edge * edge, 0.0)
    }

    /// Set the texture-coordinate scale
    pub fn with_scale(mut self, scale: Vec2) -> Self {
        self.texcoord_scale = scale;
        self
    }

    /// Set surface flags
    pub fn with_flags(mut self, flags: SurfaceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the visible fraction
    pub fn with_visibility(mut self, visible_fraction: f32) -> Self {
        self.visible_fraction = visible_fraction;
        self
    }
}

/// Scorer output for one surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    /// Required pixel area, a power-of-two edge squared
    pub virtual_size: f32,
    /// Relevance, 0..1
    pub importance: f32,
}

/// Distance at which the distance term halves
const DISTANCE_FALLOFF: f32 = 32.0;
/// Slack so exact powers of two do not round to the next level
const LEVEL_EPSILON: f32 = 1e-4;

/// Footprint to virtual size and importance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityScorer {
    min_edge: f32,
    max_edge: f32,
}

impl PriorityScorer {
    /// Create a new scorer with explicit edge limits
    pub fn new(min_edge: u32, max_edge: u32) -> Self {
        let max_edge = max_edge.max(1) as f32;
        Self {
            min_edge: (min_edge.max(1) as f32).min(max_edge),
            max_edge,
        }
    }

    /// Scorer using the configured texture limits
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.min_virtual_edge, config.max_texture_size)
    }

    /// Smallest virtual size ever reported
    pub fn min_virtual_size(&self) -> f32 {
        self.min_edge * self.min_edge
    }

    /// Largest virtual size ever reported
    pub fn max_virtual_size(&self) -> f32 {
        self.max_edge * self.max_edge
    }

    /// Score one surface
    pub fn score(&self, footprint: &Footprint) -> Score {
        let virtual_size = self.virtual_size(footprint);

        let importance = if footprint.flags.contains(SurfaceFlags::UI) {
            1.0
        } else {
            let visible = clamp01(footprint.visible_fraction);
            let footprint_term = (virtual_size / self.max_virtual_size()).sqrt();
            let distance = if footprint.distance.is_finite() {
                footprint.distance.max(0.0)
            } else {
                f32::MAX
            };
            let distance_term = 1.0 / (1.0 + distance / DISTANCE_FALLOFF);

            let mut importance = 0.6 * visible * footprint_term + 0.4 * distance_term;
            if footprint.flags.contains(SurfaceFlags::SELECTED) {
                importance += 0.3;
            }
            if footprint
                .flags
                .intersects(SurfaceFlags::ANIMATED | SurfaceFlags::PARTICLE)
            {
                importance += 0.15;
            }
            clamp01(importance)
        };

        Score {
            virtual_size,
            importance,
        }
    }

    /// Required pixel area for a footprint
    ///
    /// Degenerate footprints still report the minimum so the texture is
    /// never starved entirely.
    pub fn virtual_size(&self, footprint: &Footprint) -> f32 {
        let scale = (footprint.texcoord_scale.x * footprint.texcoord_scale.y).abs();
        let area = footprint.screen_area * scale;
        if !area.is_finite() || area <= 0.0 {
            return self.min_virtual_size();
        }
        let edge = next_power_of_two_f32(area.sqrt()).clamp(self.min_edge, self.max_edge);
        edge * edge
    }

    /// Discard level that satisfies `virtual_size` under `bias`
    ///
    /// The bias is weighted by the boost class and softened for important
    /// resources, so they are downgraded last.
    pub fn desired_level(
        &self,
        virtual_size: f32,
        ladder: &DiscardLadder,
        bias: f32,
        boost: BoostClass,
        importance: f32,
    ) -> u8 {
        if boost.forces_full_resolution() {
            return 0;
        }
        let bias = if bias.is_finite() { bias.max(1.0) } else { 1.0 };
        let effective_bias =
            1.0 + (bias - 1.0) * boost.bias_weight() * (1.0 - 0.5 * clamp01(importance));

        let wanted = (virtual_size.max(self.min_virtual_size()) / effective_bias).max(1.0);
        let ratio = ladder.full_area() / wanted;
        if ratio <= 1.0 {
            return 0;
        }
        let level = (0.5 * ratio.log2() - LEVEL_EPSILON).ceil().max(0.0);
        (level.min(ladder.max_level as f32)) as u8
    }
}

impl Default for PriorityScorer {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}
