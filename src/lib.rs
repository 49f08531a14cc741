//! Temporal anti-aliasing for wgpu renderers
//!
//! Projection jitter, velocity field and history reprojection, driven per
//! camera through [`render::taa::TemporalAntiAliasing`] on either the wgpu
//! backend or the CPU reference backend.

pub mod core;
pub mod render;

pub use crate::core::{Camera, Error, TaaConfig};
pub use crate::render::backend::{CpuBackend, Extent, GpuBackend, TemporalBackend};
pub use crate::render::taa::{ResolveOutcome, TemporalAntiAliasing};
