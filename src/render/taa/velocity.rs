//! Velocity field reprojection state
//!
//! Keeps the previous frame's view and view-projection matrices and turns the
//! current camera into the uniform block the velocity kernel consumes. The
//! kernel rebuilds each pixel's world position from depth and reprojects it
//! with the previous matrices; the screen-space difference is the velocity.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::core::camera::Camera;
use crate::core::config::ClipSpaceConvention;
use super::jitter::JitterSample;

/// Velocity kernel uniforms (must match `shaders/velocity.wgsl`)
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ReprojectionUniforms {
    /// Frustum extents at unit distance plus jitter offset (16 bytes, offset 0)
    pub projection_extents: [f32; 4],
    /// (near, far, 1.0 when the flipped previous matrix is used, 0) (16 bytes, offset 16)
    pub depth_params: [f32; 4],
    /// World to view (64 bytes, offset 32)
    pub current_view: [[f32; 4]; 4],
    /// View to world (64 bytes, offset 96)
    pub inverse_current_view: [[f32; 4]; 4],
    /// Y-flipped GPU projection times view (64 bytes, offset 160)
    pub current_view_projection: [[f32; 4]; 4],
    /// Previous frame's Y-flipped view-projection (64 bytes, offset 224)
    pub previous_view_projection: [[f32; 4]; 4],
    /// Previous frame's view-projection without the flip (64 bytes, offset 288)
    pub previous_view_projection_no_flip: [[f32; 4]; 4],
}

impl ReprojectionUniforms {
    /// Reference evaluation of the velocity kernel for one pixel
    ///
    /// `uv` is the pixel center in texture space (origin top-left), `depth`
    /// the stored [0, 1] depth. Returns `(velocity_u, velocity_v,
    /// linear_depth_01, 0)` where velocity is `current_uv - previous_uv`.
    pub fn evaluate(&self, uv: Vec2, depth: f32) -> Vec4 {
        let near = self.depth_params[0];
        let far = self.depth_params[1];
        let flipped = self.depth_params[2] > 0.5;
        let extents = Vec4::from_array(self.projection_extents);

        let ndc = Vec2::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0);
        let distance = near * far / (far - depth * (far - near));
        let view_pos = Vec3::new(
            (ndc.x * extents.x + extents.z) * distance,
            (ndc.y * extents.y + extents.w) * distance,
            -distance,
        );
        let world_pos = Mat4::from_cols_array_2d(&self.inverse_current_view).transform_point3(view_pos);

        let previous = if flipped {
            Mat4::from_cols_array_2d(&self.previous_view_projection)
        } else {
            Mat4::from_cols_array_2d(&self.previous_view_projection_no_flip)
        };
        let clip = previous * world_pos.extend(1.0);
        let prev_ndc = clip.xy() / clip.w;
        let prev_uv = if flipped {
            prev_ndc * 0.5 + 0.5
        } else {
            Vec2::new(prev_ndc.x * 0.5 + 0.5, 0.5 - prev_ndc.y * 0.5)
        };

        let velocity = uv - prev_uv;
        let depth01 = ((distance - near) / (far - near)).clamp(0.0, 1.0);
        Vec4::new(velocity.x, velocity.y, depth01, 0.0)
    }
}

/// Convert a projection into the form the GPU consumes
///
/// glam projections already map depth to [0, 1]; the remaining difference
/// is the vertical flip used when rendering into textures.
pub fn gpu_projection(projection: Mat4, flip_y: bool) -> Mat4 {
    if flip_y {
        Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)) * projection
    } else {
        projection
    }
}

/// Camera matrices for one frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraFrameState {
    pub view: Mat4,
    /// Y-flipped GPU projection
    pub projection: Mat4,
    pub projection_no_flip: Mat4,
    pub view_projection: Mat4,
    pub view_projection_no_flip: Mat4,
    pub projection_extents: Vec4,
}

impl CameraFrameState {
    pub fn from_camera(camera: &Camera, jitter: JitterSample) -> Self {
        let view = camera.view_matrix();
        let active = camera.active_projection();
        let projection = gpu_projection(active, true);
        let projection_no_flip = gpu_projection(active, false);

        Self {
            view,
            projection,
            projection_no_flip,
            view_projection: projection * view,
            view_projection_no_flip: projection_no_flip * view,
            projection_extents: camera.projection_extents(jitter.to_vec2()),
        }
    }
}

/// Matrices carried from one frame to the next
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatrixHistory {
    pub view: Mat4,
    pub view_projection: Mat4,
    pub view_projection_no_flip: Mat4,
}

impl From<&CameraFrameState> for MatrixHistory {
    fn from(frame: &CameraFrameState) -> Self {
        Self {
            view: frame.view,
            view_projection: frame.view_projection,
            view_projection_no_flip: frame.view_projection_no_flip,
        }
    }
}

/// Per-camera velocity field state
pub struct VelocityField {
    clip_space: ClipSpaceConvention,
    previous: Option<MatrixHistory>,
    current: Option<CameraFrameState>,
}

impl VelocityField {
    pub fn new(clip_space: ClipSpaceConvention) -> Self {
        Self {
            clip_space,
            previous: None,
            current: None,
        }
    }

    /// Build this frame's uniforms, then roll the matrix history forward
    ///
    /// Call once per frame after the scene has rendered with the (possibly
    /// jittered) active projection. On the first call the previous matrices
    /// equal the current ones, so the initial velocity is zero.
    pub fn update(&mut self, camera: &Camera, jitter: JitterSample) -> ReprojectionUniforms {
        let frame = CameraFrameState::from_camera(camera, jitter);
        let previous = self.previous.unwrap_or_else(|| MatrixHistory::from(&frame));

        let flipped = match self.clip_space {
            ClipSpaceConvention::YUp => 0.0,
            ClipSpaceConvention::YDown => 1.0,
        };

        let uniforms = ReprojectionUniforms {
            projection_extents: frame.projection_extents.to_array(),
            depth_params: [camera.near, camera.far, flipped, 0.0],
            current_view: frame.view.to_cols_array_2d(),
            inverse_current_view: frame.view.inverse().to_cols_array_2d(),
            current_view_projection: frame.view_projection.to_cols_array_2d(),
            previous_view_projection: previous.view_projection.to_cols_array_2d(),
            previous_view_projection_no_flip: previous.view_projection_no_flip.to_cols_array_2d(),
        };

        // Only now may the history move on; doing it earlier zeroes every velocity
        self.previous = Some(MatrixHistory::from(&frame));
        self.current = Some(frame);

        uniforms
    }

    /// Forget the matrix history (camera cut or teardown)
    pub fn reset(&mut self) {
        self.previous = None;
        self.current = None;
    }

    /// Matrices of the most recent frame
    pub fn frame_state(&self) -> Option<&CameraFrameState> {
        self.current.as_ref()
    }

    /// Matrices the next frame will reproject against
    pub fn history(&self) -> Option<&MatrixHistory> {
        self.previous.as_ref()
    }

    pub fn clip_space(&self) -> ClipSpaceConvention {
        self.clip_space
    }
}

impl Default for VelocityField {
    fn default() -> Self {
        Self::new(ClipSpaceConvention::default())
    }
}
