//! Jitter patterns for temporal anti-aliasing
//!
//! Precomputes a fixed-length Halton (2, 3) table of sub-pixel offsets. The
//! table is built once; per-frame lookups are a modulo and an index.

use glam::Vec2;

use crate::core::config::DEFAULT_SEQUENCE_LENGTH;
use crate::core::error::Error;
use crate::core::types::Result;

/// One sub-pixel offset, each component in [-0.5, 0.5)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JitterSample {
    pub u: f32,
    pub v: f32,
}

impl JitterSample {
    /// No offset
    pub const ZERO: Self = Self { u: 0.0, v: 0.0 };

    pub fn new(u: f32, v: f32) -> Self {
        Self { u, v }
    }

    /// Multiply both components
    pub fn scaled(self, scale: f32) -> Self {
        Self {
            u: self.u * scale,
            v: self.v * scale,
        }
    }

    pub fn to_vec2(self) -> Vec2 {
        Vec2::new(self.u, self.v)
    }
}

/// Generate a Halton number for the given index and base
///
/// Reverses the base-`base` digits of `index` behind the radix point.
/// `halton(0, b)` is 0; every other index maps into (0, 1).
pub fn halton(mut index: u32, base: u32) -> f32 {
    let base_f = base as f32;
    let mut f = 1.0;
    let mut r = 0.0;

    while index > 0 {
        f /= base_f;
        r += f * (index % base) as f32;
        index /= base;
    }

    r
}

/// Fixed table of centered Halton (2, 3) samples
///
/// Entry `i` is `(halton(i + 1, 2) - 0.5, halton(i + 1, 3) - 0.5)`. Starting
/// at `i + 1` keeps the degenerate `(0, 0)` Halton point out of the table.
#[derive(Clone, Debug)]
pub struct JitterSequence {
    table: Vec<JitterSample>,
}

impl JitterSequence {
    /// Build a table of `length` samples
    pub fn new(length: u32) -> Result<Self> {
        if length == 0 {
            return Err(Error::InvalidConfig(
                "jitter sequence length must be at least 1".to_string(),
            ));
        }

        Ok(Self { table: build_table(length) })
    }

    /// Sample at `index`, wrapping every `len()` entries
    pub fn sample(&self, index: u32) -> JitterSample {
        self.table[index as usize % self.table.len()]
    }

    /// Number of distinct samples before the pattern repeats
    pub fn len(&self) -> u32 {
        self.table.len() as u32
    }

    /// Always false; a sequence holds at least one sample
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn samples(&self) -> &[JitterSample] {
        &self.table
    }
}

impl Default for JitterSequence {
    fn default() -> Self {
        Self {
            table: build_table(DEFAULT_SEQUENCE_LENGTH),
        }
    }
}

fn build_table(length: u32) -> Vec<JitterSample> {
    (0..length)
        .map(|i| JitterSample::new(halton(i + 1, 2) - 0.5, halton(i + 1, 3) - 0.5))
        .collect()
}
