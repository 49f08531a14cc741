//! Per-frame projection jitter
//!
//! Pulls one sample per frame from a [`JitterSequence`] and installs the
//! matching off-center projection on the camera. The very first frame is
//! rendered without jitter so the history has a clean seed.

use glam::Vec4;

use crate::core::camera::Camera;
use crate::core::config::check_jitter_scale;
use crate::core::types::Result;
use super::jitter::{JitterSample, JitterSequence};

/// Where the applier is in the sample cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cycle {
    /// No frame has been jittered yet
    NotStarted,
    /// The zero frame has run; `next` is the table index of the next sample
    Running { next: u32, last: Option<u32> },
}

/// Current and previous jitter offsets in pixels
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JitterState {
    pub current: JitterSample,
    pub previous: JitterSample,
    cycle: Cycle,
}

impl JitterState {
    /// `(current.u, current.v, previous.u, previous.v)`
    pub fn as_vec4(&self) -> Vec4 {
        Vec4::new(self.current.u, self.current.v, self.previous.u, self.previous.v)
    }

    /// Whether the zero frame has run
    pub fn is_started(&self) -> bool {
        self.cycle != Cycle::NotStarted
    }

    /// Table index of the current sample; `None` on the zero frame or when
    /// jitter was disabled for this frame
    pub fn sample_index(&self) -> Option<u32> {
        match self.cycle {
            Cycle::NotStarted => None,
            Cycle::Running { last, .. } => last,
        }
    }
}

impl Default for JitterState {
    fn default() -> Self {
        Self {
            current: JitterSample::ZERO,
            previous: JitterSample::ZERO,
            cycle: Cycle::NotStarted,
        }
    }
}

/// Applies a jitter sample to the camera projection once per frame
pub struct ProjectionJitter {
    sequence: JitterSequence,
    state: JitterState,
    jitter_scale: f32,
    enabled: bool,
}

impl ProjectionJitter {
    pub fn new(sequence: JitterSequence, jitter_scale: f32) -> Result<Self> {
        check_jitter_scale(jitter_scale)?;
        Ok(Self {
            sequence,
            state: JitterState::default(),
            jitter_scale,
            enabled: true,
        })
    }

    /// Start enabled or disabled without touching a camera
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Advance to the next frame and update the camera projection
    ///
    /// Must run before anything culls or renders with the camera. Returns the
    /// scaled sample now in effect, in pixels.
    pub fn advance(&mut self, camera: &mut Camera) -> JitterSample {
        let cycle = match self.state.cycle {
            Cycle::NotStarted => {
                // Zero frame: clean, unjittered seed for the history
                self.state.current = JitterSample::ZERO;
                self.state.previous = JitterSample::ZERO;
                self.state.cycle = Cycle::Running { next: 0, last: None };
                camera.reset_projection();
                log::debug!("Jitter started with zero sample");
                return JitterSample::ZERO;
            }
            Cycle::Running { next, .. } => next,
        };

        self.state.previous = self.state.current;

        if !self.enabled {
            self.state.current = JitterSample::ZERO;
            self.state.cycle = Cycle::Running { next: cycle, last: None };
            camera.reset_projection();
            return JitterSample::ZERO;
        }

        let sample = self.sequence.sample(cycle).scaled(self.jitter_scale);
        self.state.current = sample;
        self.state.cycle = Cycle::Running {
            next: (cycle + 1) % self.sequence.len(),
            last: Some(cycle),
        };

        camera.set_projection(camera.jittered_projection(sample.to_vec2()));
        log::debug!("Jitter sample {}: ({:.4}, {:.4})", cycle, sample.u, sample.v);

        sample
    }

    /// Back to the not-started state with the canonical projection
    pub fn reset(&mut self, camera: &mut Camera) {
        self.state = JitterState::default();
        camera.reset_projection();
    }

    /// Enable or disable jittering
    ///
    /// Disabling restores the canonical projection immediately so a jittered
    /// matrix never leaks into passes that do not resolve it.
    pub fn set_enabled(&mut self, enabled: bool, camera: &mut Camera) {
        self.enabled = enabled;
        if !enabled {
            camera.reset_projection();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_jitter_scale(&mut self, scale: f32) -> Result<()> {
        check_jitter_scale(scale)?;
        self.jitter_scale = scale;
        Ok(())
    }

    pub fn jitter_scale(&self) -> f32 {
        self.jitter_scale
    }

    pub fn state(&self) -> &JitterState {
        &self.state
    }

    pub fn sequence(&self) -> &JitterSequence {
        &self.sequence
    }
}

impl Default for ProjectionJitter {
    fn default() -> Self {
        Self {
            sequence: JitterSequence::default(),
            state: JitterState::default(),
            jitter_scale: 1.0,
            enabled: true,
        }
    }
}
