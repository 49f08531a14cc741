//! CPU reference backend
//!
//! Runs the velocity and resolve kernels on `image` buffers with rayon. Used
//! by tests and the headless demo; the math mirrors `shaders/velocity.wgsl`
//! and `shaders/resolve.wgsl`.

use glam::{Vec2, Vec4};
use image::{ImageBuffer, Luma, Rgba32FImage};
use rayon::prelude::*;

use crate::core::config::FeatureFlags;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::taa::resolve::ResolveParams;
use crate::render::taa::velocity::ReprojectionUniforms;
use super::{BlendPass, Extent, TemporalBackend};

/// Single-channel float depth in [0, 1]
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Screen-space motion (in pixels) at which history confidence reaches zero
pub const VELOCITY_FALLOFF_PX: f32 = 4.0;

/// Samples taken along the motion vector when motion blur is on
pub const MOTION_BLUR_TAPS: u32 = 4;

/// One history buffer and how often it was written
pub struct CpuHistory {
    image: Rgba32FImage,
    writes: u32,
}

impl CpuHistory {
    pub fn image(&self) -> &Rgba32FImage {
        &self.image
    }

    /// Seed copies plus blend passes that targeted this buffer
    pub fn writes(&self) -> u32 {
        self.writes
    }
}

/// Work counters, mostly for tests
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub seeds: u32,
    pub copies: u32,
    pub presents: u32,
    pub blends: u32,
    pub velocity_passes: u32,
    pub submits: u32,
    pub live_history: u32,
    pub live_velocity: u32,
    pub live_scratch: u32,
}

/// Temporal backend evaluating the kernels on the CPU
pub struct CpuBackend {
    presented: Option<Rgba32FImage>,
    blend_kernel_enabled: bool,
    max_extent: Option<Extent>,
    stats: CpuStats,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            presented: None,
            blend_kernel_enabled: true,
            max_extent: None,
            stats: CpuStats::default(),
        }
    }

    /// Refuse allocations larger than `extent` in either dimension
    pub fn with_max_extent(mut self, extent: Extent) -> Self {
        self.max_extent = Some(extent);
        self
    }

    /// When disabled, `prepare_resolve` fails as if the blend program could
    /// not be built
    pub fn set_blend_kernel_enabled(&mut self, enabled: bool) {
        self.blend_kernel_enabled = enabled;
    }

    /// Last frame copied to the presentation target
    pub fn presented(&self) -> Option<&Rgba32FImage> {
        self.presented.as_ref()
    }

    pub fn stats(&self) -> CpuStats {
        self.stats
    }

    fn check_allocation(&self, extent: Extent, what: &str) -> Result<()> {
        if extent.is_empty() {
            return Err(Error::ResourceUnavailable(format!("{} with empty extent {}", what, extent)));
        }
        if let Some(max) = self.max_extent {
            if extent.width > max.width || extent.height > max.height {
                return Err(Error::ResourceUnavailable(format!(
                    "{} of {} exceeds limit {}",
                    what, extent, max
                )));
            }
        }
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalBackend for CpuBackend {
    type Frame = Rgba32FImage;
    type Depth = DepthImage;
    type History = CpuHistory;
    type Velocity = Rgba32FImage;

    fn frame_extent(&self, frame: &Rgba32FImage) -> Extent {
        Extent::new(frame.width(), frame.height())
    }

    fn depth_extent(&self, depth: &DepthImage) -> Extent {
        Extent::new(depth.width(), depth.height())
    }

    fn history_extent(&self, history: &CpuHistory) -> Extent {
        Extent::new(history.image.width(), history.image.height())
    }

    fn velocity_extent(&self, velocity: &Rgba32FImage) -> Extent {
        Extent::new(velocity.width(), velocity.height())
    }

    fn prepare_resolve(&mut self, _output: &Rgba32FImage) -> Result<()> {
        if self.blend_kernel_enabled {
            Ok(())
        } else {
            Err(Error::ResourceUnavailable("blend kernel disabled".to_string()))
        }
    }

    fn create_history(&mut self, extent: Extent) -> Result<CpuHistory> {
        self.check_allocation(extent, "history")?;
        self.stats.live_history += 1;
        Ok(CpuHistory {
            image: Rgba32FImage::new(extent.width, extent.height),
            writes: 0,
        })
    }

    fn release_history(&mut self, _history: CpuHistory) {
        self.stats.live_history = self.stats.live_history.saturating_sub(1);
    }

    fn create_velocity(&mut self, extent: Extent) -> Result<Rgba32FImage> {
        self.check_allocation(extent, "velocity")?;
        self.stats.live_velocity += 1;
        Ok(Rgba32FImage::new(extent.width, extent.height))
    }

    fn release_velocity(&mut self, _velocity: Rgba32FImage) {
        self.stats.live_velocity = self.stats.live_velocity.saturating_sub(1);
    }

    fn create_scratch(&mut self, like: &Rgba32FImage) -> Result<Rgba32FImage> {
        self.check_allocation(self.frame_extent(like), "scratch frame")?;
        self.stats.live_scratch += 1;
        Ok(Rgba32FImage::new(like.width(), like.height()))
    }

    fn release_scratch(&mut self, _frame: Rgba32FImage) {
        self.stats.live_scratch = self.stats.live_scratch.saturating_sub(1);
    }

    fn seed_history(&mut self, source: &Rgba32FImage, history: &mut CpuHistory) -> Result<()> {
        copy_pixels(source, &mut history.image)?;
        history.writes += 1;
        self.stats.seeds += 1;
        Ok(())
    }

    fn copy(&mut self, source: &Rgba32FImage, target: &mut Rgba32FImage) -> Result<()> {
        copy_pixels(source, target)?;
        self.stats.copies += 1;
        Ok(())
    }

    fn present(&mut self, frame: &Rgba32FImage) -> Result<()> {
        self.presented = Some(frame.clone());
        self.stats.presents += 1;
        Ok(())
    }

    fn render_velocity(
        &mut self,
        depth: &DepthImage,
        uniforms: &ReprojectionUniforms,
        velocity: &mut Rgba32FImage,
    ) -> Result<()> {
        let width = velocity.width();
        let height = velocity.height();
        let texel = Vec2::new(1.0 / width as f32, 1.0 / height as f32);
        let out: &mut [f32] = velocity;

        out.par_chunks_mut(width as usize * 4)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                    let uv = (Vec2::new(x as f32, y as f32) + 0.5) * texel;
                    let d = sample_depth(depth, uv);
                    pixel.copy_from_slice(&uniforms.evaluate(uv, d).to_array());
                }
            });

        self.stats.velocity_passes += 1;
        Ok(())
    }

    fn blend(&mut self, pass: BlendPass<'_, Self>) -> Result<()> {
        let BlendPass {
            source,
            history,
            velocity,
            params,
            history_out,
            output,
        } = pass;

        let extent = self.frame_extent(source);
        for (name, other) in [
            ("history", self.history_extent(history)),
            ("history target", self.history_extent(history_out)),
            ("output", self.frame_extent(output)),
        ] {
            if other != extent {
                return Err(Error::ResourceUnavailable(format!(
                    "{} is {} but source is {}",
                    name, other, extent
                )));
            }
        }

        let kernel = ResolveKernel::new(source, &history.image, velocity, params);
        let row_len = extent.width as usize * 4;
        let history_rows: &mut [f32] = &mut history_out.image;
        let output_rows: &mut [f32] = output;

        history_rows
            .par_chunks_mut(row_len)
            .zip(output_rows.par_chunks_mut(row_len))
            .enumerate()
            .for_each(|(y, (history_row, output_row))| {
                for x in 0..extent.width as usize {
                    let (accumulated, shown) = kernel.pixel(x as u32, y as u32);
                    history_row[x * 4..x * 4 + 4].copy_from_slice(&accumulated.to_array());
                    output_row[x * 4..x * 4 + 4].copy_from_slice(&shown.to_array());
                }
            });

        history_out.writes += 1;
        self.stats.blends += 1;
        Ok(())
    }

    fn submit(&mut self) {
        self.stats.submits += 1;
    }
}

/// Per-pixel resolve, shared by all rows of one pass
struct ResolveKernel<'a> {
    source: &'a Rgba32FImage,
    history: &'a Rgba32FImage,
    velocity: &'a Rgba32FImage,
    params: &'a ResolveParams,
    flags: FeatureFlags,
    jitter_velocity: Vec2,
    size: Vec2,
    texel: Vec2,
}

impl<'a> ResolveKernel<'a> {
    fn new(
        source: &'a Rgba32FImage,
        history: &'a Rgba32FImage,
        velocity: &'a Rgba32FImage,
        params: &'a ResolveParams,
    ) -> Self {
        Self {
            source,
            history,
            velocity,
            params,
            flags: params.flags(),
            jitter_velocity: params.jitter_velocity(),
            size: Vec2::new(source.width() as f32, source.height() as f32),
            texel: Vec2::new(1.0 / source.width() as f32, 1.0 / source.height() as f32),
        }
    }

    /// Returns (next history value, output value)
    fn pixel(&self, x: u32, y: u32) -> (Vec4, Vec4) {
        let uv = (Vec2::new(x as f32, y as f32) + 0.5) * self.texel;
        let velocity = sample_nearest(self.velocity, uv);
        let current = load(self.source, x as i64, y as i64);

        let motion = Vec2::new(velocity.x, velocity.y) - self.jitter_velocity;
        let mut history = sample_nearest(self.history, uv - motion);

        if self.flags.clip_history {
            let (lo, hi) = self.neighborhood_bounds(x, y);
            history = history.clamp(lo, hi);
        }

        let motion_px = (motion * self.size).length();
        let confidence = (1.0 - motion_px / VELOCITY_FALLOFF_PX).clamp(0.0, 1.0);
        let weight = self.params.blend_weight_min
            + (self.params.blend_weight_max - self.params.blend_weight_min) * confidence;
        let mut color = current + (history - current) * weight;

        let strength = self.params.motion_blur_strength;
        if self.flags.motion_blur && strength > 0.0 && motion_px > 0.0 {
            let mut sum = color;
            for i in 1..=MOTION_BLUR_TAPS {
                let t = i as f32 / MOTION_BLUR_TAPS as f32;
                sum += sample_nearest(self.source, uv - motion * strength * t);
            }
            let blurred = sum / (MOTION_BLUR_TAPS + 1) as f32;
            let trust = (motion_px * strength * 0.25).clamp(0.0, 1.0);
            color = color.lerp(blurred, trust);
        }

        let output = if self.flags.show_velocity {
            let v = (Vec2::new(velocity.x, velocity.y) * self.size * 0.5 + 0.5).clamp(Vec2::ZERO, Vec2::ONE);
            Vec4::new(v.x, v.y, 0.0, 1.0)
        } else if self.flags.show_depth {
            Vec4::new(velocity.z, velocity.z, velocity.z, 1.0)
        } else if self.flags.add_noise {
            let n = (dither_noise(x, y, self.params.frame_index) - 0.5) / 255.0;
            color + Vec4::new(n, n, n, 0.0)
        } else {
            color
        };

        (color, output)
    }

    /// Per-channel min and max of the 3x3 source neighborhood
    fn neighborhood_bounds(&self, x: u32, y: u32) -> (Vec4, Vec4) {
        let mut lo = Vec4::splat(f32::MAX);
        let mut hi = Vec4::splat(f32::MIN);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let c = load(self.source, x as i64 + dx, y as i64 + dy);
                lo = lo.min(c);
                hi = hi.max(c);
            }
        }
        (lo, hi)
    }
}

/// Integer hash of a pixel and frame, mapped to [0, 1)
pub fn dither_noise(x: u32, y: u32, frame: u32) -> f32 {
    let mut h = x
        .wrapping_mul(1973)
        .wrapping_add(y.wrapping_mul(9277))
        .wrapping_add(frame.wrapping_mul(26699))
        | 1;
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846c_a68b);
    h ^= h >> 16;
    (h >> 8) as f32 / (1u32 << 24) as f32
}

fn copy_pixels(source: &Rgba32FImage, target: &mut Rgba32FImage) -> Result<()> {
    if source.dimensions() != target.dimensions() {
        return Err(Error::ResourceUnavailable(format!(
            "copy from {:?} into {:?}",
            source.dimensions(),
            target.dimensions()
        )));
    }
    let target: &mut [f32] = target;
    target.copy_from_slice(source.as_raw());
    Ok(())
}

/// Texel fetch with clamped coordinates
fn load(image: &Rgba32FImage, x: i64, y: i64) -> Vec4 {
    let x = x.clamp(0, image.width() as i64 - 1) as u32;
    let y = y.clamp(0, image.height() as i64 - 1) as u32;
    Vec4::from_array(image.get_pixel(x, y).0)
}

/// Point sample with clamp-to-edge addressing
fn sample_nearest(image: &Rgba32FImage, uv: Vec2) -> Vec4 {
    let x = (uv.x * image.width() as f32).floor() as i64;
    let y = (uv.y * image.height() as f32).floor() as i64;
    load(image, x, y)
}

fn sample_depth(depth: &DepthImage, uv: Vec2) -> f32 {
    let x = ((uv.x * depth.width() as f32).floor() as i64).clamp(0, depth.width() as i64 - 1);
    let y = ((uv.y * depth.height() as f32).floor() as i64).clamp(0, depth.height() as i64 - 1);
    depth.get_pixel(x as u32, y as u32).0[0]
}

/// Frame filled with one color
pub fn solid_frame(extent: Extent, color: [f32; 4]) -> Rgba32FImage {
    Rgba32FImage::from_pixel(extent.width, extent.height, image::Rgba(color))
}

/// Depth buffer at a constant depth
pub fn uniform_depth(extent: Extent, depth: f32) -> DepthImage {
    DepthImage::from_pixel(extent.width, extent.height, Luma([depth]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::BlendParameters;
    use crate::render::taa::projection::JitterState;

    fn params(extent: Extent, blend: &BlendParameters) -> ResolveParams {
        ResolveParams::new(&JitterState::default(), extent, blend, 0)
    }

    fn blend_once(
        backend: &mut CpuBackend,
        source: &Rgba32FImage,
        history: &CpuHistory,
        velocity: &Rgba32FImage,
        params: &ResolveParams,
    ) -> (CpuHistory, Rgba32FImage) {
        let extent = backend.frame_extent(source);
        let mut history_out = backend.create_history(extent).unwrap();
        let mut output = Rgba32FImage::new(extent.width, extent.height);
        backend
            .blend(BlendPass {
                source,
                history,
                velocity,
                params,
                history_out: &mut history_out,
                output: &mut output,
            })
            .unwrap();
        (history_out, output)
    }

    #[test]
    fn test_static_blend_uses_max_weight() {
        let extent = Extent::new(4, 4);
        let mut backend = CpuBackend::new();
        let mut history = backend.create_history(extent).unwrap();
        backend
            .seed_history(&solid_frame(extent, [0.0, 0.0, 0.0, 1.0]), &mut history)
            .unwrap();

        let source = solid_frame(extent, [1.0, 1.0, 1.0, 1.0]);
        let velocity = Rgba32FImage::new(4, 4);
        let blend = BlendParameters::default();
        let (next, output) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blend));

        // zero motion: full confidence, weight = max
        let expected = 1.0 - blend.blend_weight_max();
        let px = output.get_pixel(2, 1).0;
        assert!((px[0] - expected).abs() < 1e-6, "{:?}", px);
        assert_eq!(next.image().get_pixel(2, 1), output.get_pixel(2, 1));
        assert_eq!(next.writes(), 1);
    }

    #[test]
    fn test_fast_motion_uses_min_weight() {
        let extent = Extent::new(16, 16);
        let mut backend = CpuBackend::new();
        let mut history = backend.create_history(extent).unwrap();
        backend
            .seed_history(&solid_frame(extent, [0.0, 0.0, 0.0, 1.0]), &mut history)
            .unwrap();

        let source = solid_frame(extent, [1.0, 1.0, 1.0, 1.0]);
        // 8 pixels of motion, beyond the falloff
        let velocity = solid_frame(extent, [0.5, 0.0, 0.0, 0.0]);
        let blend = BlendParameters::new(0.2, 0.9, 1.0).unwrap();
        let (_, output) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blend));

        let px = output.get_pixel(8, 8).0;
        assert!((px[0] - 0.8).abs() < 1e-6, "{:?}", px);
    }

    #[test]
    fn test_clip_history_bounds_to_neighborhood() {
        let extent = Extent::new(4, 4);
        let mut backend = CpuBackend::new();
        let mut history = backend.create_history(extent).unwrap();
        backend
            .seed_history(&solid_frame(extent, [10.0, 10.0, 10.0, 1.0]), &mut history)
            .unwrap();

        let source = solid_frame(extent, [0.5, 0.5, 0.5, 1.0]);
        let velocity = Rgba32FImage::new(4, 4);
        let mut blend = BlendParameters::default();
        blend.flags.clip_history = true;
        let (_, output) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blend));

        // clipped history equals the flat neighborhood, so the output does too
        assert_eq!(output.get_pixel(1, 1).0, [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_motion_blur_smears_along_motion() {
        let extent = Extent::new(16, 4);
        let mut backend = CpuBackend::new();
        let mut source = solid_frame(extent, [0.0, 0.0, 0.0, 1.0]);
        for (x, _, px) in source.enumerate_pixels_mut() {
            if x >= 8 {
                px.0 = [1.0, 1.0, 1.0, 1.0];
            }
        }
        let mut history = backend.create_history(extent).unwrap();
        backend.seed_history(&source, &mut history).unwrap();
        // 2 pixels of motion to the right
        let velocity = solid_frame(extent, [2.0 / 16.0, 0.0, 0.0, 0.0]);

        let plain = BlendParameters::default();
        let (_, unblurred) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &plain));

        let mut blurred_params = plain;
        blurred_params.flags.motion_blur = true;
        let (next, blurred) =
            blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blurred_params));

        // x = 9 reprojects onto the dark side; weight 0.9 gives 0.1, the taps
        // average to 0.62 and half of that trust is applied
        let before = unblurred.get_pixel(9, 1).0[0];
        let after = blurred.get_pixel(9, 1).0[0];
        assert!((before - 0.1).abs() < 1e-5, "{}", before);
        assert!((after - 0.36).abs() < 1e-5, "{}", after);
        assert_ne!(blurred, unblurred);
        assert_eq!(next.image(), &blurred);

        let mut zero_strength = blurred_params;
        zero_strength.set_motion_blur_strength(0.0).unwrap();
        let (_, off) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &zero_strength));
        assert_eq!(off, unblurred);
    }

    #[test]
    fn test_debug_views() {
        let extent = Extent::new(2, 2);
        let mut backend = CpuBackend::new();
        let mut history = backend.create_history(extent).unwrap();
        let source = solid_frame(extent, [0.3, 0.3, 0.3, 1.0]);
        backend.seed_history(&source, &mut history).unwrap();
        let velocity = solid_frame(extent, [0.0, 0.0, 0.25, 0.0]);

        let mut blend = BlendParameters::default();
        blend.flags.show_depth = true;
        let (next, output) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blend));
        assert_eq!(output.get_pixel(0, 0).0, [0.25, 0.25, 0.25, 1.0]);
        // history keeps accumulating the real image
        assert_eq!(next.image().get_pixel(0, 0).0, [0.3, 0.3, 0.3, 1.0]);

        blend.flags = FeatureFlags {
            show_velocity: true,
            ..FeatureFlags::default()
        };
        let (_, output) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blend));
        assert_eq!(output.get_pixel(1, 1).0, [0.5, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn test_noise_is_small_and_varies() {
        let extent = Extent::new(8, 8);
        let mut backend = CpuBackend::new();
        let mut history = backend.create_history(extent).unwrap();
        let source = solid_frame(extent, [0.5, 0.5, 0.5, 1.0]);
        backend.seed_history(&source, &mut history).unwrap();
        let velocity = Rgba32FImage::new(8, 8);

        let mut blend = BlendParameters::default();
        blend.flags.add_noise = true;
        let (next, output) = blend_once(&mut backend, &source, &history, &velocity, &params(extent, &blend));

        let mut distinct = std::collections::HashSet::new();
        for px in output.pixels() {
            assert!((px.0[0] - 0.5).abs() <= 0.5 / 255.0 + 1e-6);
            assert_eq!(px.0[3], 1.0);
            distinct.insert(px.0[0].to_bits());
        }
        assert!(distinct.len() > 1);
        // noise never reaches the history
        assert!(next.image().pixels().all(|p| p.0 == [0.5, 0.5, 0.5, 1.0]));
    }

    #[test]
    fn test_dither_noise_range() {
        for frame in 0..4 {
            for y in 0..16 {
                for x in 0..16 {
                    let n = dither_noise(x, y, frame);
                    assert!((0.0..1.0).contains(&n));
                }
            }
        }
        assert_ne!(dither_noise(3, 4, 0), dither_noise(3, 4, 1));
    }

    #[test]
    fn test_velocity_pass_static_camera() {
        use crate::core::camera::Camera;
        use crate::render::taa::jitter::JitterSample;
        use crate::render::taa::velocity::VelocityField;

        let camera = Camera::new(glam::Vec3::ZERO, 60.0, 8, 8);
        let mut field = VelocityField::default();
        let uniforms = field.update(&camera, JitterSample::ZERO);

        let mut backend = CpuBackend::new();
        let mut velocity = backend.create_velocity(Extent::new(8, 8)).unwrap();
        backend
            .render_velocity(&uniform_depth(Extent::new(8, 8), 0.5), &uniforms, &mut velocity)
            .unwrap();

        for px in velocity.pixels() {
            assert!(px.0[0].abs() < 1e-4 && px.0[1].abs() < 1e-4, "{:?}", px);
        }
        assert_eq!(backend.stats().velocity_passes, 1);
    }

    #[test]
    fn test_allocation_limits() {
        let mut backend = CpuBackend::new().with_max_extent(Extent::new(4, 4));
        assert!(backend.create_history(Extent::new(4, 4)).is_ok());
        assert!(matches!(
            backend.create_history(Extent::new(5, 4)),
            Err(Error::ResourceUnavailable(_))
        ));
        assert!(backend.create_velocity(Extent::new(0, 4)).is_err());
        assert_eq!(backend.stats().live_history, 1);
    }

    #[test]
    fn test_disabled_kernel_fails_prepare() {
        let mut backend = CpuBackend::new();
        let frame = Rgba32FImage::new(2, 2);
        assert!(backend.prepare_resolve(&frame).is_ok());
        backend.set_blend_kernel_enabled(false);
        assert!(backend.prepare_resolve(&frame).is_err());
    }

    #[test]
    fn test_copy_rejects_mismatched_sizes() {
        let mut backend = CpuBackend::new();
        let source = Rgba32FImage::new(2, 2);
        let mut target = Rgba32FImage::new(3, 2);
        assert!(backend.copy(&source, &mut target).is_err());
    }
}
