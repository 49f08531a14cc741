//! Backends executing the temporal anti-aliasing kernels
//!
//! The resolver and velocity state decide *what* runs each frame; a backend
//! owns the buffers and runs the per-pixel work. [`gpu::GpuBackend`] records
//! wgpu passes, [`cpu::CpuBackend`] evaluates the same kernels on the CPU for
//! tests and headless tools.

pub mod cpu;
pub mod gpu;

pub use cpu::{CpuBackend, CpuHistory, DepthImage};
pub use gpu::{GpuBackend, GpuDepth, GpuFrame};

use crate::core::types::Result;
use crate::render::taa::resolve::ResolveParams;
use crate::render::taa::velocity::ReprojectionUniforms;

/// Size of a 2D buffer in pixels
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Inputs and outputs of one blend pass
///
/// `history` is read, `history_out` and `output` are written in the same
/// pass. The two history references always point at different buffers.
pub struct BlendPass<'a, B: TemporalBackend + ?Sized> {
    pub source: &'a B::Frame,
    pub history: &'a B::History,
    pub velocity: &'a B::Velocity,
    pub params: &'a ResolveParams,
    pub history_out: &'a mut B::History,
    pub output: &'a mut B::Frame,
}

/// Buffer management and kernel execution for temporal anti-aliasing
///
/// Calls record work and return; nothing here waits for completion.
/// `submit` flushes whatever was recorded since the last call.
pub trait TemporalBackend {
    /// Color image the scene renders into and the resolve writes out
    type Frame;
    /// Depth written by the scene pass
    type Depth;
    /// One history buffer
    type History;
    /// Per-pixel motion vectors
    type Velocity;

    fn frame_extent(&self, frame: &Self::Frame) -> Extent;
    fn depth_extent(&self, depth: &Self::Depth) -> Extent;
    fn history_extent(&self, history: &Self::History) -> Extent;
    fn velocity_extent(&self, velocity: &Self::Velocity) -> Extent;

    /// Make sure the blend program for `output` exists
    ///
    /// An error here makes the resolver fall back to a plain copy.
    fn prepare_resolve(&mut self, output: &Self::Frame) -> Result<()>;

    /// Allocate one history buffer (point filtered, clamped addressing)
    fn create_history(&mut self, extent: Extent) -> Result<Self::History>;
    fn release_history(&mut self, history: Self::History);

    fn create_velocity(&mut self, extent: Extent) -> Result<Self::Velocity>;
    fn release_velocity(&mut self, velocity: Self::Velocity);

    /// Temporary output used when the host has no target for the resolve
    fn create_scratch(&mut self, like: &Self::Frame) -> Result<Self::Frame>;
    fn release_scratch(&mut self, frame: Self::Frame);

    /// Unblended copy of the source into a history buffer
    fn seed_history(&mut self, source: &Self::Frame, history: &mut Self::History) -> Result<()>;

    /// Plain pixel copy between frames
    fn copy(&mut self, source: &Self::Frame, target: &mut Self::Frame) -> Result<()>;

    /// Plain pixel copy to the backend's presentation target
    fn present(&mut self, frame: &Self::Frame) -> Result<()>;

    /// Run the velocity kernel over `depth`
    fn render_velocity(
        &mut self,
        depth: &Self::Depth,
        uniforms: &ReprojectionUniforms,
        velocity: &mut Self::Velocity,
    ) -> Result<()>;

    /// Run the resolve kernel, writing history and output together
    fn blend(&mut self, pass: BlendPass<'_, Self>) -> Result<()>;

    /// Flush recorded work without waiting for it
    fn submit(&mut self) {}
}
