//! wgpu backend
//!
//! Records the velocity, resolve and copy passes into a pending command
//! encoder. Velocity passes submit right away; everything else goes out when
//! the resolver asks. Nothing here waits on the GPU except the explicit
//! readback helpers.

use std::collections::HashMap;

use image::Rgba32FImage;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::render::context::GpuContext;
use crate::render::pipeline::{BlitPipeline, ResolvePipeline, VelocityPipeline, HISTORY_FORMAT, VELOCITY_FORMAT};
use crate::render::taa::velocity::ReprojectionUniforms;
use super::{BlendPass, Extent, TemporalBackend};

/// Format used for scene depth
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// A 2D color texture with its default view
pub struct GpuFrame {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    extent: Extent,
    format: wgpu::TextureFormat,
}

impl GpuFrame {
    /// Create a texture usable as render target, sampled input and copy source
    pub fn new(device: &wgpu::Device, extent: Extent, format: wgpu::TextureFormat, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        Self::from_texture(texture)
    }

    /// Wrap a texture created elsewhere (needs `TEXTURE_BINDING` to be read)
    pub fn from_texture(texture: wgpu::Texture) -> Self {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let size = texture.size();
        Self {
            extent: Extent::new(size.width, size.height),
            format: texture.format(),
            texture,
            view,
        }
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }
}

/// Scene depth texture
pub struct GpuDepth {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    extent: Extent,
}

impl GpuDepth {
    pub fn new(device: &wgpu::Device, extent: Extent, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view, extent }
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }
}

/// Texture the resolver presents to when the host passes no target
struct PresentTarget {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    extent: Extent,
}

/// Temporal backend recording wgpu passes
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
    velocity_pipeline: VelocityPipeline,
    resolve_pipelines: HashMap<wgpu::TextureFormat, ResolvePipeline>,
    blit_pipelines: HashMap<wgpu::TextureFormat, BlitPipeline>,
    encoder: Option<wgpu::CommandEncoder>,
    present_target: Option<PresentTarget>,
}

impl GpuBackend {
    pub fn new(gpu: &GpuContext) -> Self {
        let velocity_pipeline = VelocityPipeline::new(&gpu.device);
        log::info!("GPU temporal backend created");

        Self {
            device: gpu.device.clone(),
            queue: gpu.queue.clone(),
            adapter: gpu.adapter.clone(),
            velocity_pipeline,
            resolve_pipelines: HashMap::new(),
            blit_pipelines: HashMap::new(),
            encoder: None,
            present_target: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Where resolves without a target end up (a swapchain view, usually)
    pub fn set_present_target(&mut self, view: wgpu::TextureView, format: wgpu::TextureFormat, extent: Extent) {
        self.present_target = Some(PresentTarget { view, format, extent });
    }

    pub fn clear_present_target(&mut self) {
        self.present_target = None;
    }

    /// Whether a resolve pipeline exists for `format`
    pub fn has_resolve_pipeline(&self, format: wgpu::TextureFormat) -> bool {
        self.resolve_pipelines.contains_key(&format)
    }

    /// Record a pass that fills `depth` with a constant value
    pub fn clear_depth(&mut self, depth: &GpuDepth, value: f32) {
        let encoder = pending_encoder(&self.device, &mut self.encoder);
        let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("taa_clear_depth"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(value),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
    }

    /// Copy a frame back to the CPU and wait for it
    ///
    /// Supports `Rgba8Unorm`, `Rgba8UnormSrgb` and `Rgba16Float` frames.
    pub fn read_frame(&mut self, frame: &GpuFrame) -> Result<Rgba32FImage> {
        let bytes_per_pixel = match frame.format {
            wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Rgba8UnormSrgb => 4u32,
            wgpu::TextureFormat::Rgba16Float => 8u32,
            other => {
                return Err(Error::Gpu(format!("readback of {:?} is not supported", other)));
            }
        };

        let Extent { width, height } = frame.extent;
        let padded_bytes_per_row = (width * bytes_per_pixel).div_ceil(256) * 256;
        let buffer_size = (padded_bytes_per_row * height) as u64;

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("taa_readback_staging"),
            size: buffer_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let encoder = pending_encoder(&self.device, &mut self.encoder);
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &frame.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging_buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.submit();

        let slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map_err(|e| Error::Gpu(e.to_string()))?;

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Gpu(e.to_string())),
            Err(e) => return Err(Error::Gpu(e.to_string())),
        }

        let data = slice.get_mapped_range();
        let mut image = Rgba32FImage::new(width, height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let start = (y * padded_bytes_per_row + x * bytes_per_pixel) as usize;
            for c in 0..4 {
                pixel.0[c] = match bytes_per_pixel {
                    4 => data[start + c] as f32 / 255.0,
                    _ => {
                        let offset = start + c * 2;
                        half::f16::from_bits(u16::from_le_bytes([data[offset], data[offset + 1]])).to_f32()
                    }
                };
            }
        }
        drop(data);
        staging_buffer.unmap();

        Ok(image)
    }

    /// Upload pixels into an `Rgba8Unorm` or `Rgba16Float` frame
    pub fn write_frame(&self, frame: &GpuFrame, pixels: &Rgba32FImage) -> Result<()> {
        if Extent::new(pixels.width(), pixels.height()) != frame.extent {
            return Err(Error::ResourceUnavailable(format!(
                "upload of {}x{} into {}",
                pixels.width(),
                pixels.height(),
                frame.extent
            )));
        }

        let (bytes, bytes_per_pixel): (Vec<u8>, u32) = match frame.format {
            wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Rgba8UnormSrgb => (
                pixels
                    .as_raw()
                    .iter()
                    .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                    .collect(),
                4,
            ),
            wgpu::TextureFormat::Rgba16Float => (
                pixels
                    .as_raw()
                    .iter()
                    .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
                    .collect(),
                8,
            ),
            other => return Err(Error::Gpu(format!("upload of {:?} is not supported", other))),
        };

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &frame.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(frame.extent.width * bytes_per_pixel),
                rows_per_image: Some(frame.extent.height),
            },
            wgpu::Extent3d {
                width: frame.extent.width,
                height: frame.extent.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn check_allocation(&self, extent: Extent, format: wgpu::TextureFormat, what: &str) -> Result<()> {
        let max = self.device.limits().max_texture_dimension_2d;
        if extent.is_empty() || extent.width > max || extent.height > max {
            return Err(Error::ResourceUnavailable(format!(
                "{} of {} (limit {})",
                what, extent, max
            )));
        }

        let usages = self.adapter.get_texture_format_features(format).allowed_usages;
        if !usages.contains(wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING) {
            return Err(Error::ResourceUnavailable(format!(
                "{:?} cannot be rendered to and sampled",
                format
            )));
        }
        Ok(())
    }

    /// Copy texels between frames of equal size, converting formats if needed
    fn transfer(
        &mut self,
        source: &GpuFrame,
        target_texture: &wgpu::Texture,
        target_view: &wgpu::TextureView,
        target_format: wgpu::TextureFormat,
        target_extent: Extent,
    ) -> Result<()> {
        if source.extent != target_extent {
            return Err(Error::ResourceUnavailable(format!(
                "copy from {} into {}",
                source.extent, target_extent
            )));
        }

        if source.format == target_format {
            let encoder = pending_encoder(&self.device, &mut self.encoder);
            encoder.copy_texture_to_texture(
                source.texture.as_image_copy(),
                target_texture.as_image_copy(),
                wgpu::Extent3d {
                    width: target_extent.width,
                    height: target_extent.height,
                    depth_or_array_layers: 1,
                },
            );
            return Ok(());
        }

        self.blit(source, target_view, target_format);
        Ok(())
    }

    fn blit(&mut self, source: &GpuFrame, target_view: &wgpu::TextureView, target_format: wgpu::TextureFormat) {
        let device = &self.device;
        let pipeline = self
            .blit_pipelines
            .entry(target_format)
            .or_insert_with(|| BlitPipeline::new(device, target_format));
        let bind_group = pipeline.create_bind_group(device, &source.view);
        let encoder = pending_encoder(device, &mut self.encoder);
        pipeline.render(encoder, target_view, &bind_group);
    }
}

fn pending_encoder<'a>(
    device: &wgpu::Device,
    encoder: &'a mut Option<wgpu::CommandEncoder>,
) -> &'a mut wgpu::CommandEncoder {
    encoder.get_or_insert_with(|| {
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("taa_encoder"),
        })
    })
}

impl TemporalBackend for GpuBackend {
    type Frame = GpuFrame;
    type Depth = GpuDepth;
    type History = GpuFrame;
    type Velocity = GpuFrame;

    fn frame_extent(&self, frame: &GpuFrame) -> Extent {
        frame.extent
    }

    fn depth_extent(&self, depth: &GpuDepth) -> Extent {
        depth.extent
    }

    fn history_extent(&self, history: &GpuFrame) -> Extent {
        history.extent
    }

    fn velocity_extent(&self, velocity: &GpuFrame) -> Extent {
        velocity.extent
    }

    fn prepare_resolve(&mut self, output: &GpuFrame) -> Result<()> {
        if self.resolve_pipelines.contains_key(&output.format) {
            return Ok(());
        }

        self.check_allocation(output.extent, output.format, "resolve output")?;
        if !output.texture.usage().contains(wgpu::TextureUsages::RENDER_ATTACHMENT) {
            return Err(Error::ResourceUnavailable(
                "resolve output is not a render attachment".to_string(),
            ));
        }

        log::info!("Building resolve pipeline for {:?}", output.format);
        let pipeline = ResolvePipeline::new(&self.device, output.format);
        self.resolve_pipelines.insert(output.format, pipeline);
        Ok(())
    }

    fn create_history(&mut self, extent: Extent) -> Result<GpuFrame> {
        self.check_allocation(extent, HISTORY_FORMAT, "history")?;
        Ok(GpuFrame::new(&self.device, extent, HISTORY_FORMAT, "taa_history"))
    }

    fn release_history(&mut self, history: GpuFrame) {
        drop(history);
    }

    fn create_velocity(&mut self, extent: Extent) -> Result<GpuFrame> {
        self.check_allocation(extent, VELOCITY_FORMAT, "velocity")?;
        Ok(GpuFrame::new(&self.device, extent, VELOCITY_FORMAT, "taa_velocity"))
    }

    fn release_velocity(&mut self, velocity: GpuFrame) {
        drop(velocity);
    }

    fn create_scratch(&mut self, like: &GpuFrame) -> Result<GpuFrame> {
        self.check_allocation(like.extent, like.format, "scratch frame")?;
        Ok(GpuFrame::new(&self.device, like.extent, like.format, "taa_scratch"))
    }

    fn release_scratch(&mut self, frame: GpuFrame) {
        drop(frame);
    }

    fn seed_history(&mut self, source: &GpuFrame, history: &mut GpuFrame) -> Result<()> {
        self.transfer(source, &history.texture, &history.view, history.format, history.extent)
    }

    fn copy(&mut self, source: &GpuFrame, target: &mut GpuFrame) -> Result<()> {
        self.transfer(source, &target.texture, &target.view, target.format, target.extent)
    }

    fn present(&mut self, frame: &GpuFrame) -> Result<()> {
        let Some(target) = self.present_target.take() else {
            return Err(Error::ResourceUnavailable("no presentation target set".to_string()));
        };

        let result = if target.extent == frame.extent {
            self.blit(frame, &target.view, target.format);
            Ok(())
        } else {
            Err(Error::ResourceUnavailable(format!(
                "presentation target is {} but frame is {}",
                target.extent, frame.extent
            )))
        };
        self.present_target = Some(target);
        result
    }

    fn render_velocity(
        &mut self,
        depth: &GpuDepth,
        uniforms: &ReprojectionUniforms,
        velocity: &mut GpuFrame,
    ) -> Result<()> {
        self.velocity_pipeline.update_uniforms(&self.queue, uniforms);
        let bind_group = self.velocity_pipeline.create_bind_group(&self.device, &depth.view);
        let encoder = pending_encoder(&self.device, &mut self.encoder);
        self.velocity_pipeline.render(encoder, &velocity.view, &bind_group);
        // The uniform buffer is shared by every camera on this backend; the
        // pass has to reach the queue before the next write replaces it.
        self.submit();
        Ok(())
    }

    fn blend(&mut self, pass: BlendPass<'_, Self>) -> Result<()> {
        let Some(pipeline) = self.resolve_pipelines.get(&pass.output.format) else {
            return Err(Error::ResourceUnavailable(format!(
                "no resolve pipeline for {:?}",
                pass.output.format
            )));
        };

        pipeline.update_params(&self.queue, pass.params);
        let bind_group = pipeline.create_bind_group(
            &self.device,
            &pass.source.view,
            &pass.history.view,
            &pass.velocity.view,
        );
        let encoder = pending_encoder(&self.device, &mut self.encoder);
        pipeline.render(encoder, &pass.history_out.view, &pass.output.view, &bind_group);
        Ok(())
    }

    fn submit(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }
}
