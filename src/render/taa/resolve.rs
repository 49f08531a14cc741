//! History reprojection resolve
//!
//! Runs once per output frame. Owns the ping-pong history pair, seeds it on
//! the first frame and otherwise blends the reprojected history with the new
//! source frame. Any failure to build the blend program or allocate history
//! degrades to a plain copy so the host always gets a picture.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};

use crate::core::config::{BlendParameters, FeatureFlags};
use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::backend::{BlendPass, Extent, TemporalBackend};
use super::history::HistoryPair;
use super::projection::JitterState;

/// Blend kernel uniforms (must match `shaders/resolve.wgsl`)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ResolveParams {
    /// (currentU, currentV, previousU, previousV) in UV units
    pub jitter: [f32; 4],
    /// (1 / width, 1 / height, width, height)
    pub texel_size: [f32; 4],
    pub blend_weight_min: f32,
    pub blend_weight_max: f32,
    pub motion_blur_strength: f32,
    pub flags: u32,
    pub frame_index: u32,
    pub _pad: [u32; 3],
}

impl ResolveParams {
    pub fn new(jitter: &JitterState, extent: Extent, blend: &BlendParameters, frame_index: u32) -> Self {
        let width = extent.width.max(1) as f32;
        let height = extent.height.max(1) as f32;
        let pixels = jitter.as_vec4();

        Self {
            jitter: [
                pixels.x / width,
                pixels.y / height,
                pixels.z / width,
                pixels.w / height,
            ],
            texel_size: [1.0 / width, 1.0 / height, width, height],
            blend_weight_min: blend.blend_weight_min(),
            blend_weight_max: blend.blend_weight_max(),
            motion_blur_strength: blend.motion_blur_strength(),
            flags: blend.flags.bits(),
            frame_index,
            _pad: [0; 3],
        }
    }

    pub fn jitter(&self) -> Vec4 {
        Vec4::from_array(self.jitter)
    }

    /// Screen motion caused by the jitter change alone, in UV units
    ///
    /// A positive horizontal offset moves the frustum right, so the image
    /// moves left; a positive vertical offset moves it down the texture.
    pub fn jitter_velocity(&self) -> Vec2 {
        let j = self.jitter();
        Vec2::new(-(j.x - j.z), j.y - j.w)
    }

    pub fn flags(&self) -> FeatureFlags {
        FeatureFlags::from_bits(self.flags)
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.texel_size[2] as u32, self.texel_size[3] as u32)
    }
}

/// What a resolve did this frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// First frame: history seeded with the unblended source
    Seeded,
    /// History blended from `read` into `write`
    Blended { read: usize, write: usize },
    /// Source copied unblended; history left uninitialized
    Fallback,
}

/// Drives the blend kernel and the history pair for one camera
pub struct HistoryResolver<B: TemporalBackend> {
    blend: BlendParameters,
    history: Option<HistoryPair<B::History>>,
    frame_index: u32,
    fallback_logged: bool,
}

impl<B: TemporalBackend> HistoryResolver<B> {
    pub fn new(blend: BlendParameters) -> Result<Self> {
        blend.validate()?;
        Ok(Self {
            blend,
            history: None,
            frame_index: 0,
            fallback_logged: false,
        })
    }

    pub fn blend(&self) -> &BlendParameters {
        &self.blend
    }

    /// Replace the blend parameters; invalid values leave the old ones
    pub fn set_blend(&mut self, blend: BlendParameters) -> Result<()> {
        if let Err(e) = blend.validate() {
            log::warn!("Rejected blend parameters: {}", e);
            return Err(e);
        }
        self.blend = blend;
        Ok(())
    }

    pub fn set_flags(&mut self, flags: FeatureFlags) {
        self.blend.flags = flags;
    }

    pub fn history(&self) -> Option<&HistoryPair<B::History>> {
        self.history.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.history.as_ref().is_some_and(|h| h.is_initialized())
    }

    /// Number of blended frames since the history was last seeded
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Drop the accumulated history; the next resolve reseeds
    pub fn invalidate(&mut self) {
        if let Some(history) = self.history.as_mut() {
            history.invalidate();
        }
        self.frame_index = 0;
    }

    /// Resolve `source` into `target`, or into a scratch frame that is then
    /// presented when there is no target
    pub fn resolve(
        &mut self,
        backend: &mut B,
        source: &B::Frame,
        velocity: &B::Velocity,
        jitter: &JitterState,
        target: Option<&mut B::Frame>,
    ) -> Result<ResolveOutcome> {
        if let Some(target) = target {
            return self.resolve_into(backend, source, velocity, jitter, target);
        }

        let mut scratch = match backend.create_scratch(source) {
            Ok(scratch) => scratch,
            Err(e) => return self.bypass(backend, source, None, e),
        };

        let outcome = self.resolve_into(backend, source, velocity, jitter, &mut scratch);
        let presented = match &outcome {
            Ok(_) => backend.present(&scratch),
            Err(_) => Ok(()),
        };
        backend.submit();
        backend.release_scratch(scratch);

        presented?;
        outcome
    }

    /// Resolve `source` into `target`
    pub fn resolve_into(
        &mut self,
        backend: &mut B,
        source: &B::Frame,
        velocity: &B::Velocity,
        jitter: &JitterState,
        target: &mut B::Frame,
    ) -> Result<ResolveOutcome> {
        let extent = backend.frame_extent(source);
        let target_extent = backend.frame_extent(target);
        if target_extent != extent {
            return Err(Error::ResourceUnavailable(format!(
                "resolve target is {} but source is {}",
                target_extent, extent
            )));
        }

        if let Err(e) = backend.prepare_resolve(target) {
            return self.fallback(backend, source, target, e);
        }

        if let Err(e) = self.ensure_history(backend, extent) {
            return self.fallback(backend, source, target, e);
        }

        let Some(history) = self.history.as_mut() else {
            return self.fallback(
                backend,
                source,
                target,
                Error::ResourceUnavailable("history pair missing".to_string()),
            );
        };

        if !history.is_initialized() {
            let seeded = backend
                .seed_history(source, history.seed_target())
                .and_then(|_| backend.copy(source, target));
            if let Err(e) = seeded {
                return self.fallback(backend, source, target, e);
            }

            history.mark_seeded();
            self.frame_index = 0;
            self.fallback_logged = false;
            backend.submit();
            log::debug!("History seeded at {}", extent);
            return Ok(ResolveOutcome::Seeded);
        }

        let (Some(read), Some(write)) = (history.read_index(), history.write_index()) else {
            return self.fallback(
                backend,
                source,
                target,
                Error::ResourceUnavailable("history indices unset".to_string()),
            );
        };

        let params = ResolveParams::new(jitter, extent, &self.blend, self.frame_index);
        let blended = match history.read_write() {
            Some((history_in, history_out)) => backend.blend(BlendPass {
                source,
                history: history_in,
                velocity,
                params: &params,
                history_out,
                output: target,
            }),
            None => Err(Error::ResourceUnavailable("history pair not readable".to_string())),
        };
        if let Err(e) = blended {
            return self.fallback(backend, source, target, e);
        }

        history.swap();
        self.frame_index = self.frame_index.wrapping_add(1);
        backend.submit();
        log::trace!("Resolved history {} -> {}", read, write);

        Ok(ResolveOutcome::Blended { read, write })
    }

    /// Copy the source through without touching the history
    ///
    /// Used when an input the blend needs (the velocity field) is missing.
    pub fn bypass(
        &mut self,
        backend: &mut B,
        source: &B::Frame,
        target: Option<&mut B::Frame>,
        error: Error,
    ) -> Result<ResolveOutcome> {
        match target {
            Some(target) => self.fallback(backend, source, target, error),
            None => {
                self.log_fallback(&error);
                self.invalidate();
                backend.present(source)?;
                backend.submit();
                Ok(ResolveOutcome::Fallback)
            }
        }
    }

    /// Release both history buffers
    pub fn release(&mut self, backend: &mut B) {
        if let Some(history) = self.history.take() {
            log::info!("Releasing history pair ({})", history.extent());
            for buffer in history.into_buffers() {
                backend.release_history(buffer);
            }
        }
        self.frame_index = 0;
    }

    /// Allocate the pair at `extent`, replacing a pair of another size
    fn ensure_history(&mut self, backend: &mut B, extent: Extent) -> Result<()> {
        if let Some(history) = self.history.as_ref() {
            if history.extent() == extent {
                return Ok(());
            }
            log::warn!(
                "Source changed from {} to {}, reallocating history",
                history.extent(),
                extent
            );
            self.release(backend);
        }

        let first = backend.create_history(extent)?;
        let second = match backend.create_history(extent) {
            Ok(second) => second,
            Err(e) => {
                backend.release_history(first);
                return Err(e);
            }
        };

        log::info!("Allocated history pair ({})", extent);
        self.history = Some(HistoryPair::new([first, second], extent));
        self.frame_index = 0;
        Ok(())
    }

    /// Copy the source unblended and leave the history uninitialized
    fn fallback(
        &mut self,
        backend: &mut B,
        source: &B::Frame,
        target: &mut B::Frame,
        error: Error,
    ) -> Result<ResolveOutcome> {
        self.log_fallback(&error);
        self.invalidate();
        backend.copy(source, target)?;
        backend.submit();
        Ok(ResolveOutcome::Fallback)
    }

    fn log_fallback(&mut self, error: &Error) {
        if self.fallback_logged {
            log::debug!("Temporal resolve unavailable: {}", error);
        } else {
            log::warn!("Temporal resolve unavailable, copying source: {}", error);
            self.fallback_logged = true;
        }
    }
}
