//! Temporal anti-aliasing configuration
//!
//! Everything the host may tune at runtime lives here. Values are validated
//! when they are set or loaded, never while a frame is being blended.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Number of entries in the jitter table by default
pub const DEFAULT_SEQUENCE_LENGTH: u32 = 16;

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

/// Optional code paths of the resolve kernel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Output the raw velocity field instead of the resolved image
    pub show_velocity: bool,
    /// Output the linearized depth instead of the resolved image
    pub show_depth: bool,
    /// Add dither noise to break up banding
    pub add_noise: bool,
    /// Smear along the velocity vector, scaled by `motion_blur_strength`
    pub motion_blur: bool,
    /// Clip the reprojected history to the local neighborhood color bounds
    pub clip_history: bool,
}

impl FeatureFlags {
    pub const SHOW_VELOCITY: u32 = 1 << 0;
    pub const SHOW_DEPTH: u32 = 1 << 1;
    pub const ADD_NOISE: u32 = 1 << 2;
    pub const MOTION_BLUR: u32 = 1 << 3;
    pub const CLIP_HISTORY: u32 = 1 << 4;

    /// Pack into the bitmask the kernels read
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.show_velocity {
            bits |= Self::SHOW_VELOCITY;
        }
        if self.show_depth {
            bits |= Self::SHOW_DEPTH;
        }
        if self.add_noise {
            bits |= Self::ADD_NOISE;
        }
        if self.motion_blur {
            bits |= Self::MOTION_BLUR;
        }
        if self.clip_history {
            bits |= Self::CLIP_HISTORY;
        }
        bits
    }

    /// Unpack a kernel bitmask
    pub fn from_bits(bits: u32) -> Self {
        Self {
            show_velocity: bits & Self::SHOW_VELOCITY != 0,
            show_depth: bits & Self::SHOW_DEPTH != 0,
            add_noise: bits & Self::ADD_NOISE != 0,
            motion_blur: bits & Self::MOTION_BLUR != 0,
            clip_history: bits & Self::CLIP_HISTORY != 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Blend parameters
// ---------------------------------------------------------------------------

/// History blend bounds, motion blur strength and kernel feature flags
///
/// Invariant: `0 <= blend_weight_min <= blend_weight_max <= 1` and
/// `motion_blur_strength >= 0`. Use [`BlendParameters::new`] or the setters;
/// after deserializing call [`BlendParameters::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendParameters {
    blend_weight_min: f32,
    blend_weight_max: f32,
    motion_blur_strength: f32,
    /// Kernel code paths
    pub flags: FeatureFlags,
}

impl Default for BlendParameters {
    fn default() -> Self {
        Self {
            blend_weight_min: 0.85,
            blend_weight_max: 0.95,
            motion_blur_strength: 1.0,
            flags: FeatureFlags::default(),
        }
    }
}

impl BlendParameters {
    /// Create validated parameters with all feature flags off
    pub fn new(blend_weight_min: f32, blend_weight_max: f32, motion_blur_strength: f32) -> Result<Self> {
        let params = Self {
            blend_weight_min,
            blend_weight_max,
            motion_blur_strength,
            flags: FeatureFlags::default(),
        };
        params.validate()?;
        Ok(params)
    }

    /// Lower bound of the history weight (used where reprojection is unreliable)
    pub fn blend_weight_min(&self) -> f32 {
        self.blend_weight_min
    }

    /// Upper bound of the history weight (used in static regions)
    pub fn blend_weight_max(&self) -> f32 {
        self.blend_weight_max
    }

    pub fn motion_blur_strength(&self) -> f32 {
        self.motion_blur_strength
    }

    /// Replace both weight bounds; on error nothing changes
    pub fn set_blend_weights(&mut self, min: f32, max: f32) -> Result<()> {
        check_weight_bounds(min, max)?;
        self.blend_weight_min = min;
        self.blend_weight_max = max;
        Ok(())
    }

    /// Replace the motion blur strength; on error nothing changes
    pub fn set_motion_blur_strength(&mut self, strength: f32) -> Result<()> {
        check_strength(strength)?;
        self.motion_blur_strength = strength;
        Ok(())
    }

    /// Check the invariants
    pub fn validate(&self) -> Result<()> {
        check_weight_bounds(self.blend_weight_min, self.blend_weight_max)?;
        check_strength(self.motion_blur_strength)
    }
}

fn check_weight_bounds(min: f32, max: f32) -> Result<()> {
    if !min.is_finite() || !max.is_finite() {
        return Err(Error::InvalidConfig(format!(
            "blend weights must be finite (min={}, max={})",
            min, max
        )));
    }
    if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) {
        return Err(Error::InvalidConfig(format!(
            "blend weights must lie in [0, 1] (min={}, max={})",
            min, max
        )));
    }
    if min > max {
        return Err(Error::InvalidConfig(format!(
            "blend_weight_min ({}) exceeds blend_weight_max ({})",
            min, max
        )));
    }
    Ok(())
}

fn check_strength(strength: f32) -> Result<()> {
    if !strength.is_finite() || strength < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "motion_blur_strength must be finite and >= 0 (got {})",
            strength
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clip-space convention
// ---------------------------------------------------------------------------

/// Vertical orientation of clip space relative to texture rows
///
/// Selects which previous view-projection the velocity kernel reprojects
/// with. wgpu normalizes every backend to a Y-up NDC with texture rows
/// running downward, so `YUp` is right for it; hosts feeding the uniforms to
/// a renderer that flips Y when rendering to textures pick `YDown`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipSpaceConvention {
    /// NDC +Y points up; use the non-flipped previous view-projection
    #[default]
    YUp,
    /// NDC +Y points down the texture; use the flipped previous view-projection
    YDown,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Full temporal anti-aliasing configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaaConfig {
    /// Whether the projection is jittered at all
    pub jitter_enabled: bool,
    /// Multiplier applied to every jitter sample (pixels per unit sample)
    pub jitter_scale: f32,
    /// Number of Halton samples before the pattern repeats
    pub sequence_length: u32,
    /// Resolve blend parameters
    pub blend: BlendParameters,
    /// Which previous view-projection the velocity kernel uses
    pub clip_space: ClipSpaceConvention,
}

impl Default for TaaConfig {
    fn default() -> Self {
        Self {
            jitter_enabled: true,
            jitter_scale: 1.0,
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
            blend: BlendParameters::default(),
            clip_space: ClipSpaceConvention::default(),
        }
    }
}

impl TaaConfig {
    /// Check every field
    pub fn validate(&self) -> Result<()> {
        check_jitter_scale(self.jitter_scale)?;
        if self.sequence_length == 0 {
            return Err(Error::InvalidConfig(
                "sequence_length must be at least 1".to_string(),
            ));
        }
        self.blend.validate()
    }

    /// Load and validate a JSON config
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        log::debug!("Loaded TAA config from {}", path.display());
        Ok(config)
    }

    /// Save as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Jitter scale must be a finite, non-negative pixel multiplier
pub(crate) fn check_jitter_scale(scale: f32) -> Result<()> {
    if !scale.is_finite() || scale < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "jitter_scale must be finite and >= 0 (got {})",
            scale
        )));
    }
    Ok(())
}
