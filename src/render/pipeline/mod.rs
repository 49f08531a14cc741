//! Render pipelines

pub mod blit;
pub mod resolve;
pub mod velocity;

pub use blit::BlitPipeline;
pub use resolve::{ResolvePipeline, HISTORY_FORMAT};
pub use velocity::{VelocityPipeline, VELOCITY_FORMAT};

/// Attachment that overwrites every texel of `view`
fn color_attachment(view: &wgpu::TextureView) -> wgpu::RenderPassColorAttachment<'_> {
    wgpu::RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: wgpu::Operations {
            load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
            store: wgpu::StoreOp::Store,
        },
        depth_slice: None,
    }
}
