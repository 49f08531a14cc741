//! Headless temporal anti-aliasing demo
//!
//! Renders a small ray-cast scene (a sphere over a checkered floor) through
//! the full frame protocol and writes the resolved frame as a PNG.
//!
//! Usage:
//!     taa_demo [OPTIONS]
//!
//! Options:
//!     --gpu                   Resolve on the GPU instead of the CPU backend
//!     --config <FILE>         Load a JSON TaaConfig
//!     -n, --frames <N>        Frames to accumulate (default: 16)
//!     --size <W>x<H>          Output size in pixels (default: 320x180)
//!     --orbit <DEG>           Camera orbit per frame in degrees (default: 0)
//!     -o, --output <FILE>     Output PNG (default: taa_demo.png)
//!     -h, --help              Show this help message

use std::env;
use std::path::PathBuf;
use std::time::Instant;

use glam::{Vec2, Vec3, Vec4};
use image::{DynamicImage, Rgba32FImage};

use temporal_aa::core::logging;
use temporal_aa::core::types::Result;
use temporal_aa::render::backend::cpu::DepthImage;
use temporal_aa::render::backend::gpu::{GpuDepth, GpuFrame};
use temporal_aa::render::context::GpuContext;
use temporal_aa::{Camera, CpuBackend, Extent, GpuBackend, ResolveOutcome, TaaConfig, TemporalAntiAliasing};

fn print_help() {
    eprintln!("taa_demo - Temporal anti-aliasing demo");
    eprintln!();
    eprintln!("Usage: taa_demo [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("    --gpu                   Resolve on the GPU instead of the CPU backend");
    eprintln!("    --config <FILE>         Load a JSON TaaConfig");
    eprintln!("    -n, --frames <N>        Frames to accumulate (default: 16)");
    eprintln!("    --size <W>x<H>          Output size in pixels (default: 320x180)");
    eprintln!("    --orbit <DEG>           Camera orbit per frame in degrees (default: 0)");
    eprintln!("    -o, --output <FILE>     Output PNG (default: taa_demo.png)");
    eprintln!("    -h, --help              Show this help message");
    eprintln!();
    eprintln!("Example:");
    eprintln!("    taa_demo -n 32 --size 640x360 -o resolved.png");
    eprintln!("    taa_demo --gpu --orbit 0.5");
}

#[derive(Debug)]
struct Args {
    gpu: bool,
    config: Option<PathBuf>,
    frames: u32,
    extent: Extent,
    orbit_degrees: f32,
    output: PathBuf,
}

fn parse_size(value: &str) -> std::result::Result<Extent, String> {
    let (w, h) = value
        .split_once('x')
        .ok_or_else(|| format!("Invalid size: {} (expected WxH)", value))?;
    let width: u32 = w.parse().map_err(|_| format!("Invalid width: {}", w))?;
    let height: u32 = h.parse().map_err(|_| format!("Invalid height: {}", h))?;
    if width == 0 || height == 0 {
        return Err(format!("Size must be non-zero: {}", value));
    }
    Ok(Extent::new(width, height))
}

fn parse_args() -> std::result::Result<Args, String> {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut parsed = Args {
        gpu: false,
        config: None,
        frames: 16,
        extent: Extent::new(320, 180),
        orbit_degrees: 0.0,
        output: PathBuf::from("taa_demo.png"),
    };

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("Missing value for {}", flag))
        };

        match flag {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--gpu" => parsed.gpu = true,
            "--config" => parsed.config = Some(PathBuf::from(value()?)),
            "-n" | "--frames" => {
                let v = value()?;
                parsed.frames = v.parse().map_err(|_| format!("Invalid frame count: {}", v))?;
            }
            "--size" => parsed.extent = parse_size(&value()?)?,
            "--orbit" => {
                let v = value()?;
                parsed.orbit_degrees = v.parse().map_err(|_| format!("Invalid orbit: {}", v))?;
            }
            "-o" | "--output" => parsed.output = PathBuf::from(value()?),
            other => return Err(format!("Unknown option: {}", other)),
        }
        i += 1;
    }

    Ok(parsed)
}

const SPHERE_CENTER: Vec3 = Vec3::new(0.0, 0.0, 0.0);
const SPHERE_RADIUS: f32 = 1.0;
const FLOOR_HEIGHT: f32 = -1.0;

/// Ray cast the scene with the camera's active (jittered) projection
fn render_scene(camera: &Camera, extent: Extent) -> (Rgba32FImage, DepthImage) {
    let view_projection = camera.view_projection();
    let inverse = view_projection.inverse();
    let light = Vec3::new(0.5, 1.0, 0.3).normalize();

    let mut color = Rgba32FImage::new(extent.width, extent.height);
    let mut depth = DepthImage::new(extent.width, extent.height);

    for (x, y, pixel) in color.enumerate_pixels_mut() {
        let uv = Vec2::new(
            (x as f32 + 0.5) / extent.width as f32,
            (y as f32 + 0.5) / extent.height as f32,
        );
        let ndc = Vec2::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0);
        let near = inverse.project_point3(ndc.extend(0.0));
        let far = inverse.project_point3(ndc.extend(1.0));
        let dir = (far - near).normalize();

        let mut hit: Option<(f32, Vec4)> = None;

        // sphere
        let oc = near - SPHERE_CENTER;
        let b = oc.dot(dir);
        let c = oc.length_squared() - SPHERE_RADIUS * SPHERE_RADIUS;
        let disc = b * b - c;
        if disc >= 0.0 {
            let t = -b - disc.sqrt();
            if t > 0.0 {
                let normal = (near + dir * t - SPHERE_CENTER).normalize();
                let shade = 0.15 + 0.85 * normal.dot(light).max(0.0);
                hit = Some((t, Vec4::new(0.9 * shade, 0.35 * shade, 0.2 * shade, 1.0)));
            }
        }

        // floor
        if dir.y.abs() > 1e-6 {
            let t = (FLOOR_HEIGHT - near.y) / dir.y;
            if t > 0.0 && hit.is_none_or(|(closest, _)| t < closest) {
                let p = near + dir * t;
                let checker = ((p.x * 2.0).floor() + (p.z * 2.0).floor()) as i32 & 1;
                let v = if checker == 0 { 0.85 } else { 0.1 };
                hit = Some((t, Vec4::new(v, v, v, 1.0)));
            }
        }

        match hit {
            Some((t, rgba)) => {
                pixel.0 = rgba.to_array();
                let z = view_projection.project_point3(near + dir * t).z;
                depth.put_pixel(x, y, image::Luma([z.clamp(0.0, 1.0)]));
            }
            None => {
                pixel.0 = [0.45, 0.6, 0.85, 1.0];
                depth.put_pixel(x, y, image::Luma([1.0]));
            }
        }
    }

    (color, depth)
}

fn orbit(camera: &mut Camera, frame: u32, degrees_per_frame: f32, extent: Extent) {
    let angle = (frame as f32 * degrees_per_frame).to_radians();
    let position = Vec3::new(4.0 * angle.sin(), 0.75, 4.0 * angle.cos());
    let placed = Camera::look_at(position, SPHERE_CENTER, Vec3::Y, extent.width, extent.height);
    camera.position = placed.position;
    camera.rotation = placed.rotation;
}

fn run_cpu(args: &Args, config: &TaaConfig) -> Result<Rgba32FImage> {
    let mut backend = CpuBackend::new();
    let mut taa = TemporalAntiAliasing::<CpuBackend>::new(config)?;
    let mut camera = Camera::look_at(Vec3::new(0.0, 0.75, 4.0), SPHERE_CENTER, Vec3::Y, args.extent.width, args.extent.height);
    let mut output = Rgba32FImage::new(args.extent.width, args.extent.height);

    for frame in 0..args.frames {
        orbit(&mut camera, frame, args.orbit_degrees, args.extent);
        taa.begin_frame(&mut camera)?;
        let (source, depth) = render_scene(&camera, args.extent);
        taa.after_scene_render(&mut backend, &camera, &depth)?;
        let outcome = taa.resolve(&mut backend, &source, Some(&mut output))?;
        log::debug!("Frame {}: {:?}", frame, outcome);
    }

    taa.shutdown(&mut backend, &mut camera);
    Ok(output)
}

fn run_gpu(args: &Args, config: &TaaConfig) -> Result<Rgba32FImage> {
    let gpu = GpuContext::headless_blocking()?;
    let mut backend = GpuBackend::new(&gpu);
    let mut taa = TemporalAntiAliasing::<GpuBackend>::new(config)?;
    let mut camera = Camera::look_at(Vec3::new(0.0, 0.75, 4.0), SPHERE_CENTER, Vec3::Y, args.extent.width, args.extent.height);

    let format = wgpu::TextureFormat::Rgba8Unorm;
    let source = GpuFrame::new(&gpu.device, args.extent, format, "demo_source");
    let mut output = GpuFrame::new(&gpu.device, args.extent, format, "demo_output");
    let depth = GpuDepth::new(&gpu.device, args.extent, "demo_depth");

    let mut last = ResolveOutcome::Fallback;
    for frame in 0..args.frames {
        orbit(&mut camera, frame, args.orbit_degrees, args.extent);
        taa.begin_frame(&mut camera)?;
        let (pixels, _) = render_scene(&camera, args.extent);
        backend.write_frame(&source, &pixels)?;
        // Depth cannot be uploaded; approximate it with the sphere's depth
        let center_depth = camera.view_projection().project_point3(SPHERE_CENTER).z;
        backend.clear_depth(&depth, center_depth.clamp(0.0, 1.0));
        taa.after_scene_render(&mut backend, &camera, &depth)?;
        last = taa.resolve(&mut backend, &source, Some(&mut output))?;
    }
    log::info!("Last GPU resolve: {:?}", last);

    let image = backend.read_frame(&output)?;
    taa.shutdown(&mut backend, &mut camera);
    Ok(image)
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => TaaConfig::load(path)?,
        None => TaaConfig::default(),
    };

    let start = Instant::now();
    let image = if args.gpu {
        run_gpu(args, &config)?
    } else {
        run_cpu(args, &config)?
    };

    DynamicImage::ImageRgba32F(image).to_rgba8().save(&args.output)?;

    println!(
        "Resolved {} frames at {} in {:.2}s -> {}",
        args.frames,
        args.extent,
        start.elapsed().as_secs_f64(),
        args.output.display()
    );
    Ok(())
}

fn main() {
    logging::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
