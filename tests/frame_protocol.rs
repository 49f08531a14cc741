//! Full frame protocol through the CPU backend

use glam::Vec3;
use image::Rgba32FImage;

use temporal_aa::core::config::{BlendParameters, FeatureFlags, TaaConfig};
use temporal_aa::core::logging;
use temporal_aa::render::backend::cpu::{solid_frame, uniform_depth, DepthImage};
use temporal_aa::render::taa::FramePhase;
use temporal_aa::{Camera, CpuBackend, Error, Extent, ResolveOutcome, TemporalAntiAliasing};

struct Harness {
    backend: CpuBackend,
    taa: TemporalAntiAliasing<CpuBackend>,
    camera: Camera,
    depth: DepthImage,
    extent: Extent,
}

impl Harness {
    fn new(extent: Extent, config: TaaConfig) -> Self {
        logging::init_for_tests();
        Self {
            backend: CpuBackend::new(),
            taa: TemporalAntiAliasing::new(&config).unwrap(),
            camera: Camera::new(Vec3::new(0.0, 0.0, 5.0), 60.0, extent.width, extent.height),
            depth: uniform_depth(extent, 0.9),
            extent,
        }
    }

    fn unjittered(extent: Extent) -> Self {
        let config = TaaConfig {
            jitter_enabled: false,
            ..TaaConfig::default()
        };
        Self::new(extent, config)
    }

    fn frame(&mut self, source: &Rgba32FImage, output: &mut Rgba32FImage) -> ResolveOutcome {
        self.taa.begin_frame(&mut self.camera).unwrap();
        self.taa
            .after_scene_render(&mut self.backend, &self.camera, &self.depth)
            .unwrap();
        self.taa
            .resolve(&mut self.backend, source, Some(output))
            .unwrap()
    }

    fn output(&self) -> Rgba32FImage {
        Rgba32FImage::new(self.extent.width, self.extent.height)
    }

    fn history_writes(&self) -> [u32; 2] {
        let history = self.taa.resolver().history().unwrap();
        [history.get(0).writes(), history.get(1).writes()]
    }

    fn shutdown(&mut self) {
        self.taa.shutdown(&mut self.backend, &mut self.camera);
    }
}

#[test]
fn test_solid_color_passes_through_exactly() {
    let extent = Extent::new(2, 2);
    let mut h = Harness::unjittered(extent);
    let source = solid_frame(extent, [0.2, 0.4, 0.6, 1.0]);
    let mut output = h.output();

    let outcomes: Vec<_> = (0..3).map(|_| h.frame(&source, &mut output)).collect();

    assert_eq!(outcomes[0], ResolveOutcome::Seeded);
    assert!(matches!(outcomes[1], ResolveOutcome::Blended { .. }));
    assert!(matches!(outcomes[2], ResolveOutcome::Blended { .. }));
    assert_eq!(output, source);
    h.shutdown();
}

#[test]
fn test_solid_color_exact_with_jitter() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::new(extent, TaaConfig::default());
    let source = solid_frame(extent, [0.7, 0.1, 0.3, 1.0]);
    let mut output = h.output();

    for _ in 0..5 {
        h.frame(&source, &mut output);
    }
    assert_eq!(output, source);
    assert!(h.camera.has_projection_override());
    h.shutdown();
}

#[test]
fn test_first_resolve_seeds_history_with_source() {
    let extent = Extent::new(3, 2);
    let mut h = Harness::unjittered(extent);
    let mut source = solid_frame(extent, [0.0, 0.0, 0.0, 1.0]);
    source.put_pixel(1, 1, image::Rgba([1.0, 0.5, 0.25, 1.0]));
    let mut output = h.output();

    assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Seeded);

    let history = h.taa.resolver().history().unwrap();
    assert_eq!(history.read_index(), Some(0));
    assert_eq!(history.get(0).image(), &source);
    assert_eq!(output, source);
    assert_eq!(h.history_writes(), [1, 0]);
    h.shutdown();
}

#[test]
fn test_each_resolve_writes_one_buffer_and_swaps() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::unjittered(extent);
    let source = solid_frame(extent, [0.5, 0.5, 0.5, 1.0]);
    let mut output = h.output();

    h.frame(&source, &mut output);
    let mut expected_read = 0;
    for _ in 0..6 {
        let before = h.history_writes();
        let outcome = h.frame(&source, &mut output);
        let after = h.history_writes();

        let ResolveOutcome::Blended { read, write } = outcome else {
            panic!("expected a blend, got {:?}", outcome);
        };
        assert_ne!(read, write);
        assert_eq!(read, expected_read);
        assert_eq!(after[write], before[write] + 1);
        assert_eq!(after[read], before[read]);

        let history = h.taa.resolver().history().unwrap();
        assert_eq!(history.read_index(), Some(write));
        assert_ne!(history.read_index(), history.write_index());
        expected_read = write;
    }
    h.shutdown();
}

#[test]
fn test_static_scene_converges_monotonically() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::unjittered(extent);
    let black = solid_frame(extent, [0.0, 0.0, 0.0, 1.0]);
    let white = solid_frame(extent, [1.0, 1.0, 1.0, 1.0]);
    let mut output = h.output();

    h.frame(&black, &mut output);
    let mut previous = 0.0;
    for _ in 0..20 {
        h.frame(&white, &mut output);
        let value = output.get_pixel(2, 2).0[0];
        assert!(value > previous, "{} did not increase from {}", value, previous);
        assert!(value <= 1.0);
        previous = value;
    }
    // 1 - 0.95^20
    assert!(previous > 0.6, "converged only to {}", previous);
    h.shutdown();
}

#[test]
fn test_swapped_blend_bounds_rejected() {
    assert!(matches!(
        BlendParameters::new(0.95, 0.85, 1.0),
        Err(Error::InvalidConfig(_))
    ));

    let config: TaaConfig = serde_json::from_str(
        r#"{ "blend": { "blend_weight_min": 0.95, "blend_weight_max": 0.85 } }"#,
    )
    .unwrap();
    assert!(matches!(
        TemporalAntiAliasing::<CpuBackend>::new(&config),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_rejected_setter_keeps_previous_values() {
    let mut h = Harness::unjittered(Extent::new(2, 2));
    let before = *h.taa.blend();

    let mut swapped = before;
    assert!(swapped.set_blend_weights(0.95, 0.85).is_err());
    assert_eq!(swapped, before);

    assert!(h.taa.set_jitter_scale(-2.0).is_err());
    assert_eq!(h.taa.jitter().jitter_scale(), 1.0);

    let tuned = BlendParameters::new(0.5, 0.75, 0.0).unwrap();
    h.taa.set_blend(tuned).unwrap();
    assert_eq!(*h.taa.blend(), tuned);
}

#[test]
fn test_missing_blend_kernel_falls_back_to_copy() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::unjittered(extent);
    h.backend.set_blend_kernel_enabled(false);
    let source = solid_frame(extent, [0.9, 0.1, 0.1, 1.0]);
    let mut output = h.output();

    assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Fallback);
    assert_eq!(output, source);
    assert!(!h.taa.resolver().is_initialized());
    assert_eq!(h.backend.stats().blends, 0);

    h.backend.set_blend_kernel_enabled(true);
    assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Seeded);
    h.shutdown();
}

#[test]
fn test_allocation_failure_falls_back_to_copy() {
    let extent = Extent::new(8, 8);
    let mut h = Harness::unjittered(extent);
    h.backend = CpuBackend::new().with_max_extent(Extent::new(4, 4));
    let source = solid_frame(extent, [0.3, 0.6, 0.9, 1.0]);
    let mut output = h.output();

    for _ in 0..3 {
        assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Fallback);
        assert_eq!(output, source);
    }
    assert!(h.taa.resolver().history().is_none());
    assert_eq!(h.backend.stats().live_history, 0);
}

#[test]
fn test_resolution_change_reallocates_and_reseeds() {
    let small = Extent::new(4, 4);
    let large = Extent::new(8, 6);
    let mut h = Harness::unjittered(small);
    let mut output = h.output();
    let source = solid_frame(small, [0.5, 0.5, 0.5, 1.0]);

    h.frame(&source, &mut output);
    assert!(matches!(h.frame(&source, &mut output), ResolveOutcome::Blended { .. }));

    h.camera.set_viewport(large.width, large.height);
    h.depth = uniform_depth(large, 0.9);
    h.extent = large;
    let source = solid_frame(large, [0.25, 0.25, 0.25, 1.0]);
    let mut output = h.output();

    assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Seeded);
    assert_eq!(output, source);
    assert_eq!(h.taa.resolver().history().unwrap().extent(), large);
    assert_eq!(h.backend.stats().live_history, 2);
    assert_eq!(h.backend.stats().live_velocity, 1);
    h.shutdown();
}

#[test]
fn test_mismatched_target_is_an_error() {
    let mut h = Harness::unjittered(Extent::new(4, 4));
    let source = solid_frame(Extent::new(4, 4), [0.5; 4]);
    let mut output = Rgba32FImage::new(2, 2);

    h.taa.begin_frame(&mut h.camera).unwrap();
    h.taa
        .after_scene_render(&mut h.backend, &h.camera, &h.depth)
        .unwrap();
    assert!(matches!(
        h.taa.resolve(&mut h.backend, &source, Some(&mut output)),
        Err(Error::ResourceUnavailable(_))
    ));
}

#[test]
fn test_missing_target_presents_result() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::unjittered(extent);
    let source = solid_frame(extent, [0.1, 0.2, 0.3, 1.0]);

    for expected in [ResolveOutcome::Seeded, ResolveOutcome::Blended { read: 0, write: 1 }] {
        h.taa.begin_frame(&mut h.camera).unwrap();
        h.taa
            .after_scene_render(&mut h.backend, &h.camera, &h.depth)
            .unwrap();
        let outcome = h.taa.resolve(&mut h.backend, &source, None).unwrap();
        assert_eq!(outcome, expected);
        assert_eq!(h.backend.presented(), Some(&source));
    }

    assert_eq!(h.backend.stats().presents, 2);
    assert_eq!(h.backend.stats().live_scratch, 0);
    h.shutdown();
}

#[test]
fn test_out_of_order_calls_fail_fast() {
    let extent = Extent::new(2, 2);
    let mut h = Harness::unjittered(extent);
    let source = solid_frame(extent, [0.5; 4]);
    let mut output = h.output();

    assert_eq!(h.taa.phase(), FramePhase::Idle);
    assert!(matches!(
        h.taa.resolve(&mut h.backend, &source, Some(&mut output)),
        Err(Error::FrameOrder(_))
    ));
    assert!(matches!(
        h.taa.after_scene_render(&mut h.backend, &h.camera, &h.depth),
        Err(Error::FrameOrder(_))
    ));

    h.taa.begin_frame(&mut h.camera).unwrap();
    assert!(matches!(h.taa.begin_frame(&mut h.camera), Err(Error::FrameOrder(_))));
    assert!(matches!(
        h.taa.resolve(&mut h.backend, &source, Some(&mut output)),
        Err(Error::FrameOrder(_))
    ));

    h.taa
        .after_scene_render(&mut h.backend, &h.camera, &h.depth)
        .unwrap();
    assert!(matches!(
        h.taa.after_scene_render(&mut h.backend, &h.camera, &h.depth),
        Err(Error::FrameOrder(_))
    ));

    h.taa.resolve(&mut h.backend, &source, Some(&mut output)).unwrap();
    assert!(matches!(
        h.taa.resolve(&mut h.backend, &source, Some(&mut output)),
        Err(Error::FrameOrder(_))
    ));
    assert_eq!(h.taa.phase(), FramePhase::Resolved);
    h.shutdown();
}

#[test]
fn test_shutdown_releases_everything() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::new(extent, TaaConfig::default());
    let source = solid_frame(extent, [0.5; 4]);
    let mut output = h.output();

    h.frame(&source, &mut output);
    h.frame(&source, &mut output);
    assert_eq!(h.backend.stats().live_history, 2);
    assert_eq!(h.backend.stats().live_velocity, 1);
    assert!(h.camera.has_projection_override());

    h.shutdown();

    assert_eq!(h.backend.stats().live_history, 0);
    assert_eq!(h.backend.stats().live_velocity, 0);
    assert!(h.taa.resolver().history().is_none());
    assert!(h.taa.velocity().is_none());
    assert!(!h.camera.has_projection_override());
    assert!(!h.taa.jitter_state().is_started());
    assert!(h.taa.velocity_field().history().is_none());
    assert_eq!(h.taa.phase(), FramePhase::Idle);

    // usable again after shutdown
    assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Seeded);
    h.shutdown();
}

#[test]
fn test_camera_cut_reseeds() {
    let extent = Extent::new(4, 4);
    let mut h = Harness::unjittered(extent);
    let source = solid_frame(extent, [0.5; 4]);
    let mut output = h.output();

    h.frame(&source, &mut output);
    h.frame(&source, &mut output);
    h.taa.reset_history(&mut h.camera);
    assert_eq!(h.frame(&source, &mut output), ResolveOutcome::Seeded);
    h.shutdown();
}

#[test]
fn test_camera_motion_produces_velocity() {
    let extent = Extent::new(16, 16);
    let mut h = Harness::unjittered(extent);
    let source = solid_frame(extent, [0.5; 4]);
    let mut output = h.output();

    h.frame(&source, &mut output);
    h.camera.position.x += 0.5;
    h.frame(&source, &mut output);

    let velocity = h.taa.velocity().unwrap();
    for px in velocity.pixels() {
        assert!(px.0[0] < -1e-3, "expected leftward motion, got {:?}", px);
        assert!(px.0[2] > 0.0 && px.0[2] < 1.0);
    }
    h.shutdown();
}

#[test]
fn test_velocity_debug_view() {
    let extent = Extent::new(4, 4);
    let config = TaaConfig {
        jitter_enabled: false,
        ..TaaConfig::default()
    };
    let mut h = Harness::new(extent, config);
    h.taa.set_flags(FeatureFlags {
        show_velocity: true,
        ..FeatureFlags::default()
    });
    let source = solid_frame(extent, [0.9; 4]);
    let mut output = h.output();

    h.frame(&source, &mut output);
    h.frame(&source, &mut output);

    // static camera: zero velocity maps to mid-grey red/green
    let px = output.get_pixel(1, 2).0;
    assert!((px[0] - 0.5).abs() < 1e-3 && (px[1] - 0.5).abs() < 1e-3, "{:?}", px);
    assert_eq!(px[2], 0.0);
    h.shutdown();
}

#[test]
fn test_config_file_drives_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taa.json");

    let mut config = TaaConfig::default();
    config.sequence_length = 4;
    config.jitter_scale = 0.5;
    config.blend = BlendParameters::new(0.6, 0.9, 0.5).unwrap();
    config.blend.flags.clip_history = true;
    config.save(&path).unwrap();

    let loaded = TaaConfig::load(&path).unwrap();
    let taa = TemporalAntiAliasing::<CpuBackend>::new(&loaded).unwrap();
    assert_eq!(taa.jitter().sequence().len(), 4);
    assert_eq!(taa.jitter().jitter_scale(), 0.5);
    assert_eq!(*taa.blend(), config.blend);
}
