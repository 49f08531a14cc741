//! Temporal anti-aliasing
//!
//! Jitters the projection every frame, derives per-pixel motion from the
//! camera's matrix history and blends a reprojected history buffer with the
//! new frame.
//!
//! A host drives one [`TemporalAntiAliasing`] per camera:
//!
//! 1. [`begin_frame`](TemporalAntiAliasing::begin_frame) before culling
//! 2. render the scene (color + depth) with the camera's active projection
//! 3. [`after_scene_render`](TemporalAntiAliasing::after_scene_render)
//! 4. [`resolve`](TemporalAntiAliasing::resolve)
//!
//! and calls [`shutdown`](TemporalAntiAliasing::shutdown) on teardown.

pub mod history;
pub mod jitter;
pub mod projection;
pub mod resolve;
pub mod velocity;

pub use history::HistoryPair;
pub use jitter::{halton, JitterSample, JitterSequence};
pub use projection::{JitterState, ProjectionJitter};
pub use resolve::{HistoryResolver, ResolveOutcome, ResolveParams};
pub use velocity::{CameraFrameState, MatrixHistory, ReprojectionUniforms, VelocityField};

use crate::core::camera::Camera;
use crate::core::config::{BlendParameters, FeatureFlags, TaaConfig};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::backend::{Extent, TemporalBackend};

/// Position in the per-frame call protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    /// No frame started since creation or shutdown
    Idle,
    Begun,
    SceneRendered,
    Resolved,
}

/// All temporal anti-aliasing state for one camera
pub struct TemporalAntiAliasing<B: TemporalBackend> {
    jitter: ProjectionJitter,
    velocity_field: VelocityField,
    resolver: HistoryResolver<B>,
    velocity: Option<B::Velocity>,
    velocity_ready: bool,
    phase: FramePhase,
}

impl<B: TemporalBackend> TemporalAntiAliasing<B> {
    pub fn new(config: &TaaConfig) -> Result<Self> {
        config.validate()?;

        let sequence = JitterSequence::new(config.sequence_length)?;
        let jitter = ProjectionJitter::new(sequence, config.jitter_scale)?
            .with_enabled(config.jitter_enabled);

        Ok(Self {
            jitter,
            velocity_field: VelocityField::new(config.clip_space),
            resolver: HistoryResolver::new(config.blend)?,
            velocity: None,
            velocity_ready: false,
            phase: FramePhase::Idle,
        })
    }

    /// Apply this frame's jitter to the camera
    ///
    /// Must run before visibility and culling so every pass of the frame
    /// sees the same projection.
    pub fn begin_frame(&mut self, camera: &mut Camera) -> Result<JitterSample> {
        if self.phase == FramePhase::Begun {
            return Err(Error::FrameOrder(
                "begin_frame called twice without rendering".to_string(),
            ));
        }

        let sample = self.jitter.advance(camera);
        self.velocity_ready = false;
        self.phase = FramePhase::Begun;
        Ok(sample)
    }

    /// Build the velocity field from the scene's depth
    ///
    /// Runs after the scene has rendered into the source frame and depth.
    /// Rolls the camera matrix history forward.
    pub fn after_scene_render(
        &mut self,
        backend: &mut B,
        camera: &Camera,
        depth: &B::Depth,
    ) -> Result<ReprojectionUniforms> {
        if self.phase != FramePhase::Begun {
            return Err(Error::FrameOrder(format!(
                "after_scene_render called in phase {:?}",
                self.phase
            )));
        }
        self.phase = FramePhase::SceneRendered;

        let uniforms = self.velocity_field.update(camera, self.jitter.state().current);
        let extent = Extent::new(camera.pixel_width, camera.pixel_height);
        let depth_extent = backend.depth_extent(depth);
        if depth_extent != extent {
            log::warn!("Depth is {} but camera viewport is {}", depth_extent, extent);
        }

        if let Err(e) = self.ensure_velocity(backend, depth_extent) {
            log::warn!("Velocity buffer unavailable: {}", e);
            return Ok(uniforms);
        }

        if let Some(velocity) = self.velocity.as_mut() {
            match backend.render_velocity(depth, &uniforms, velocity) {
                Ok(()) => self.velocity_ready = true,
                Err(e) => log::warn!("Velocity pass failed: {}", e),
            }
        }

        Ok(uniforms)
    }

    /// Blend history with `source` and write the anti-aliased frame
    ///
    /// With no `target` the result goes to the backend's presentation
    /// target.
    pub fn resolve(
        &mut self,
        backend: &mut B,
        source: &B::Frame,
        target: Option<&mut B::Frame>,
    ) -> Result<ResolveOutcome> {
        if self.phase != FramePhase::SceneRendered {
            return Err(Error::FrameOrder(format!(
                "resolve called in phase {:?}",
                self.phase
            )));
        }
        self.phase = FramePhase::Resolved;

        match self.velocity.as_ref() {
            Some(velocity) if self.velocity_ready => {
                self.resolver
                    .resolve(backend, source, velocity, self.jitter.state(), target)
            }
            _ => self.resolver.bypass(
                backend,
                source,
                target,
                Error::ResourceUnavailable("velocity field not rendered".to_string()),
            ),
        }
    }

    /// Release history and velocity buffers and restore the camera
    pub fn shutdown(&mut self, backend: &mut B, camera: &mut Camera) {
        self.resolver.release(backend);
        if let Some(velocity) = self.velocity.take() {
            backend.release_velocity(velocity);
        }
        self.velocity_ready = false;
        self.jitter.reset(camera);
        self.velocity_field.reset();
        self.phase = FramePhase::Idle;
        log::info!("Temporal anti-aliasing shut down");
    }

    /// Forget all temporal state after a camera cut
    ///
    /// Buffers stay allocated; the next frame starts unjittered and reseeds
    /// the history.
    pub fn reset_history(&mut self, camera: &mut Camera) {
        self.jitter.reset(camera);
        self.velocity_field.reset();
        self.resolver.invalidate();
    }

    pub fn set_blend(&mut self, blend: BlendParameters) -> Result<()> {
        self.resolver.set_blend(blend)
    }

    pub fn set_flags(&mut self, flags: FeatureFlags) {
        self.resolver.set_flags(flags);
    }

    pub fn set_jitter_enabled(&mut self, enabled: bool, camera: &mut Camera) {
        self.jitter.set_enabled(enabled, camera);
    }

    pub fn set_jitter_scale(&mut self, scale: f32) -> Result<()> {
        self.jitter.set_jitter_scale(scale).inspect_err(|e| {
            log::warn!("Rejected jitter scale {}: {}", scale, e);
        })
    }

    pub fn blend(&self) -> &BlendParameters {
        self.resolver.blend()
    }

    pub fn jitter(&self) -> &ProjectionJitter {
        &self.jitter
    }

    pub fn jitter_state(&self) -> &JitterState {
        self.jitter.state()
    }

    pub fn velocity_field(&self) -> &VelocityField {
        &self.velocity_field
    }

    pub fn resolver(&self) -> &HistoryResolver<B> {
        &self.resolver
    }

    /// The velocity buffer written by the last `after_scene_render`
    pub fn velocity(&self) -> Option<&B::Velocity> {
        self.velocity.as_ref()
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    fn ensure_velocity(&mut self, backend: &mut B, extent: Extent) -> Result<()> {
        if let Some(velocity) = self.velocity.as_ref() {
            if backend.velocity_extent(velocity) == extent {
                return Ok(());
            }
        }
        if let Some(velocity) = self.velocity.take() {
            backend.release_velocity(velocity);
        }

        let velocity = backend.create_velocity(extent)?;
        log::info!("Allocated velocity buffer ({})", extent);
        self.velocity = Some(velocity);
        Ok(())
    }
}

impl<B: TemporalBackend> Drop for TemporalAntiAliasing<B> {
    fn drop(&mut self) {
        if self.resolver.history().is_some() || self.velocity.is_some() {
            log::warn!("Temporal anti-aliasing dropped without shutdown");
        }
    }
}
