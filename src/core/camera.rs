//! Camera for 3D rendering

use crate::core::types::{Vec2, Vec3, Vec4, Mat4, Quat};

/// Camera with position, rotation, projection parameters and a pixel viewport
///
/// The camera distinguishes the *canonical* projection, always derived from
/// its parameters, from the *active* projection used for this frame. Jitter
/// installs an off-center active projection; [`Camera::reset_projection`]
/// puts the canonical one back so non-jittered consumers never see it.
#[derive(Clone, Debug)]
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
    /// Viewport width in pixels
    pub pixel_width: u32,
    /// Viewport height in pixels
    pub pixel_height: u32,
    /// Projection installed for the current frame, if any
    projection_override: Option<Mat4>,
}

impl Camera {
    /// Create a new camera rendering into a `width` x `height` viewport
    pub fn new(position: Vec3, fov_y_degrees: f32, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            position,
            rotation: Quat::IDENTITY,
            fov_y: fov_y_degrees.to_radians(),
            aspect: width as f32 / height as f32,
            near: 0.01,
            far: 1000.0,
            pixel_width: width,
            pixel_height: height,
            projection_override: None,
        }
    }

    /// Create camera looking at a target
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3, width: u32, height: u32) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        let rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));

        Self {
            rotation,
            ..Self::new(position, 60.0, width, height)
        }
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        let rotation_matrix = Mat4::from_quat(self.rotation.conjugate());
        let translation_matrix = Mat4::from_translation(-self.position);
        rotation_matrix * translation_matrix
    }

    /// Canonical (never jittered) projection matrix
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }

    /// Projection matrix in effect for the current frame
    pub fn active_projection(&self) -> Mat4 {
        self.projection_override.unwrap_or_else(|| self.projection_matrix())
    }

    /// Install a projection for the remainder of the frame
    pub fn set_projection(&mut self, projection: Mat4) {
        self.projection_override = Some(projection);
    }

    /// Drop any installed projection and go back to the canonical one
    pub fn reset_projection(&mut self) {
        self.projection_override = None;
    }

    /// Whether a non-canonical projection is installed
    pub fn has_projection_override(&self) -> bool {
        self.projection_override.is_some()
    }

    /// Combined view-projection using the active projection
    pub fn view_projection(&self) -> Mat4 {
        self.active_projection() * self.view_matrix()
    }

    /// Frustum extents at unit distance, shifted by a sub-pixel offset
    ///
    /// Returns `(extent_x, extent_y, jitter_x, jitter_y)`: the half-width and
    /// half-height of the view frustum one unit in front of the camera, and
    /// the offset of its center for `texel_offset` pixels of jitter.
    pub fn projection_extents(&self, texel_offset: Vec2) -> Vec4 {
        let extent_y = (0.5 * self.fov_y).tan();
        let extent_x = extent_y * self.aspect;
        let texel_size_x = extent_x / (0.5 * self.pixel_width as f32);
        let texel_size_y = extent_y / (0.5 * self.pixel_height as f32);

        Vec4::new(
            extent_x,
            extent_y,
            texel_size_x * texel_offset.x,
            texel_size_y * texel_offset.y,
        )
    }

    /// Off-center projection whose frustum is shifted by `texel_offset` pixels
    pub fn jittered_projection(&self, texel_offset: Vec2) -> Mat4 {
        let extents = self.projection_extents(texel_offset);
        let n = self.near;

        let left = (extents.z - extents.x) * n;
        let right = (extents.z + extents.x) * n;
        let bottom = (extents.w - extents.y) * n;
        let top = (extents.w + extents.y) * n;

        perspective_off_center_rh(left, right, bottom, top, n, self.far)
    }

    /// Get forward direction (negative Z in camera space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    /// Get right direction (positive X in camera space)
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Get up direction (positive Y in camera space)
    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// Set rotation from euler angles (yaw, pitch in radians)
    pub fn set_rotation_euler(&mut self, yaw: f32, pitch: f32) {
        self.rotation = Quat::from_euler(glam::EulerRot::YXZ, yaw, pitch, 0.0);
    }

    /// Update the pixel viewport (call on resize)
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.pixel_width = width;
            self.pixel_height = height;
            self.aspect = width as f32 / height as f32;
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 1280, 720)
    }
}

/// Right-handed off-center perspective with a [0, 1] depth range
///
/// Bounds are given on the near plane. With symmetric bounds this matches
/// `Mat4::perspective_rh`.
pub fn perspective_off_center_rh(
    left: f32,
    right: f32,
    bottom: f32,
    top: f32,
    near: f32,
    far: f32,
) -> Mat4 {
    let inv_width = 1.0 / (right - left);
    let inv_height = 1.0 / (top - bottom);
    let r = far / (near - far);

    Mat4::from_cols(
        Vec4::new(2.0 * near * inv_width, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 * near * inv_height, 0.0, 0.0),
        Vec4::new((right + left) * inv_width, (top + bottom) * inv_height, r, -1.0),
        Vec4::new(0.0, 0.0, r * near, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_mat_close(a: Mat4, b: Mat4, eps: f32) {
        let a = a.to_cols_array();
        let b = b.to_cols_array();
        for i in 0..16 {
            assert!((a[i] - b[i]).abs() < eps, "element {} differs: {} vs {}", i, a[i], b[i]);
        }
    }

    #[test]
    fn test_directions() {
        let camera = Camera::default();

        // Default camera looks down -Z
        let forward = camera.forward();
        assert!((forward.z - (-1.0)).abs() < 0.001);

        let right = camera.right();
        assert!((right.x - 1.0).abs() < 0.001);

        let up = camera.up();
        assert!((up.y - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_view_matrix_translation() {
        let mut camera = Camera::default();
        camera.position = Vec3::new(10.0, 0.0, 0.0);

        let view = camera.view_matrix();
        let origin_in_camera = view.transform_point3(Vec3::ZERO);
        assert!((origin_in_camera.x - (-10.0)).abs() < 0.001);
    }

    #[test]
    fn test_active_projection_defaults_to_canonical() {
        let mut camera = Camera::default();
        assert_eq!(camera.active_projection(), camera.projection_matrix());

        camera.set_projection(Mat4::IDENTITY);
        assert!(camera.has_projection_override());
        assert_eq!(camera.active_projection(), Mat4::IDENTITY);

        camera.reset_projection();
        assert!(!camera.has_projection_override());
        assert_eq!(camera.active_projection(), camera.projection_matrix());
    }

    #[test]
    fn test_zero_offset_matches_symmetric_perspective() {
        let camera = Camera::default();
        let jittered = camera.jittered_projection(Vec2::ZERO);
        assert_mat_close(jittered, camera.projection_matrix(), 1e-4);
    }

    #[test]
    fn test_jitter_shifts_image_by_offset_pixels() {
        let camera = Camera::new(Vec3::ZERO, 60.0, 200, 100);
        let offset = Vec2::new(0.25, -0.4);
        let proj = camera.jittered_projection(offset);

        // A point on the view axis lands at the image center without jitter;
        // with jitter it moves by exactly -offset pixels.
        let ndc = proj.project_point3(Vec3::new(0.0, 0.0, -5.0));
        let shift_x = ndc.x * camera.pixel_width as f32 * 0.5;
        let shift_y = ndc.y * camera.pixel_height as f32 * 0.5;
        assert!((shift_x + offset.x).abs() < 1e-3, "x shift {}", shift_x);
        assert!((shift_y + offset.y).abs() < 1e-3, "y shift {}", shift_y);
    }

    #[test]
    fn test_projection_extents() {
        let camera = Camera::new(Vec3::ZERO, 90.0, 100, 100);
        let extents = camera.projection_extents(Vec2::new(1.0, 0.0));

        // 90 degree fov: one unit out the frustum is two units tall
        assert!((extents.y - 1.0).abs() < 1e-5);
        assert!((extents.x - 1.0).abs() < 1e-5);
        // one pixel of a 100 pixel wide viewport spanning two units
        assert!((extents.z - 0.02).abs() < 1e-6);
        assert_eq!(extents.w, 0.0);
    }

    #[test]
    fn test_set_viewport_updates_aspect() {
        let mut camera = Camera::default();
        camera.set_viewport(800, 400);
        assert_eq!((camera.pixel_width, camera.pixel_height), (800, 400));
        assert!((camera.aspect - 2.0).abs() < 1e-6);

        // zero sizes are ignored
        camera.set_viewport(0, 400);
        assert_eq!(camera.pixel_width, 800);
    }
}
