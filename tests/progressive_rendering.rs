use std::{f32::consts::PI, sync::Arc, thread, time::Duration};

use image::{Rgba, Rgba32FImage};
use nalgebra::{Point3, Vector3};

use progressive_path_tracer::{
    camera::Camera,
    config::RendererConfig,
    error::RenderError,
    render_system::{
        device::host::{HostDevice, MemoryEvent},
        frame_scheduler::{FramePhase, FrameScheduler},
        scene::{Material, Scene, SceneBuilder},
        settings::{AmbientLightType, RenderSettings, WorldSettings},
    },
    utils::{self, luminance},
};

fn config(resolution: [u32; 2], render: RenderSettings, world: WorldSettings) -> RendererConfig {
    RendererConfig {
        resolution,
        render,
        world,
        disable_kernel_cache: true,
        ..Default::default()
    }
}

fn scheduler(config: &RendererConfig, scene: Scene) -> FrameScheduler<HostDevice> {
    let mut scheduler = FrameScheduler::new(Arc::new(HostDevice::new()), config).unwrap();
    scheduler.upload_scene(scene).unwrap();
    scheduler
}

fn run_frames(scheduler: &mut FrameScheduler<HostDevice>, frames: usize) {
    for _ in 0..frames {
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
    }
}

fn mean_color(scheduler: &FrameScheduler<HostDevice>) -> Vector3<f32> {
    let color = scheduler.color_buffer().unwrap();
    let sum = color
        .iter()
        .fold(Vector3::zeros(), |acc, c| acc + Vector3::from(*c));
    sum / (color.len() as f32 * scheduler.sample_number() as f32)
}

// diffuse floor at y = 0 under a 2x2 emitter at y = 1, seen from straight above through a
// narrow lens so every pixel looks at the point below the emitter's center
fn area_light_scene(albedo: f32, emission: f32) -> Scene {
    let mut builder = SceneBuilder::new();
    let floor = builder.add_material("floor", Material::diffuse([albedo; 3]));
    let light = builder.add_material("light", Material::emissive([emission; 3]));
    let (positions, indices) = utils::quad(Point3::origin(), Vector3::z() * 5.0, Vector3::x() * 5.0);
    builder.add_mesh(&positions, &indices, None, None, floor);
    let (positions, indices) = utils::quad(Point3::new(0.0, 1.0, 0.0), Vector3::x(), Vector3::z());
    builder.add_mesh(&positions, &indices, None, None, light);
    builder.set_camera(Camera::look_at(
        Point3::new(0.0, 0.5, 0.0),
        Point3::origin(),
        Vector3::z(),
        1.0_f32.to_radians(),
    ));
    builder.build()
}

// a single emitter filling the whole view
fn constant_color_scene(emission: f32) -> Scene {
    let mut builder = SceneBuilder::new();
    let wall = builder.add_material("wall", Material::emissive([emission; 3]));
    let (positions, indices) = utils::quad(
        Point3::new(0.0, 0.0, -1.0),
        Vector3::x() * 50.0,
        Vector3::y() * 50.0,
    );
    builder.add_mesh(&positions, &indices, None, None, wall);
    builder.set_camera(Camera::look_at(
        Point3::origin(),
        Point3::new(0.0, 0.0, -1.0),
        Vector3::y(),
        40.0_f32.to_radians(),
    ));
    builder.build()
}

// one quad behind the camera, so every camera ray escapes to the environment
fn empty_view_scene() -> Scene {
    let mut builder = SceneBuilder::new();
    let white = builder.add_material("white", Material::diffuse([0.5; 3]));
    let (positions, indices) = utils::quad(Point3::new(0.0, 0.0, 5.0), Vector3::x(), Vector3::y());
    builder.add_mesh(&positions, &indices, None, None, white);
    builder.set_camera(Camera::look_at(
        Point3::origin(),
        Point3::new(0.0, 0.0, -1.0),
        Vector3::y(),
        40.0_f32.to_radians(),
    ));
    builder.build()
}

// form factor from a point to a parallel rectangle whose corner lies straight above it
fn corner_form_factor(width: f32, depth: f32, height: f32) -> f32 {
    let x = width / height;
    let y = depth / height;
    let sx = (1.0 + x * x).sqrt();
    let sy = (1.0 + y * y).sqrt();
    (x / sx * (y / sx).atan() + y / sy * (x / sy).atan()) / (2.0 * PI)
}

#[test]
fn area_light_matches_analytic_radiance() {
    let albedo = 0.5;
    let emission = 1.0;
    let render = RenderSettings {
        max_bounces: 1,
        samples_per_frame: 8,
        max_samples: 64,
        ..Default::default()
    };
    let world = WorldSettings {
        ambient_light_type: AmbientLightType::None,
        ..Default::default()
    };
    let mut scheduler = scheduler(
        &config([16, 16], render, world),
        area_light_scene(albedo, emission),
    );
    while !scheduler.is_rendering_done() {
        run_frames(&mut scheduler, 1);
    }
    assert_eq!(scheduler.sample_number(), 64);

    // the emitter splits into four unit squares around the point below its center
    let irradiance = PI * emission * 4.0 * corner_form_factor(1.0, 1.0, 1.0);
    let expected = albedo / PI * irradiance;
    let measured = mean_color(&scheduler);
    for channel in measured.iter() {
        let error = (channel - expected).abs() / expected;
        assert!(error < 0.05, "measured {channel}, expected {expected}");
    }
}

#[test]
fn frozen_samples_accumulate_linearly() {
    let render = RenderSettings {
        max_bounces: 3,
        samples_per_frame: 2,
        freeze_random: true,
        ..Default::default()
    };
    let config = config([12, 8], render, WorldSettings::default());
    let mut renderer = scheduler(&config, utils::cornell_box());

    run_frames(&mut renderer, 1);
    let first = renderer.color_buffer().unwrap();
    run_frames(&mut renderer, 2);
    let third = renderer.color_buffer().unwrap();
    assert_eq!(renderer.sample_number(), 6);

    // every frame adds the same samples again
    for (a, c) in first.iter().zip(&third) {
        for i in 0..3 {
            assert!((c[i] - 3.0 * a[i]).abs() <= 1e-4 * (1.0 + c[i]), "{a:?} {c:?}");
        }
    }

    // and a fresh renderer reproduces the first frame bit for bit
    let mut other = scheduler(&config, utils::cornell_box());
    run_frames(&mut other, 1);
    assert_eq!(other.color_buffer().unwrap(), first);
}

#[test]
fn adaptive_sampling_converges_on_constant_color() {
    let render = RenderSettings {
        max_bounces: 2,
        enable_adaptive_sampling: true,
        adaptive_sampling_min_samples: 4,
        adaptive_sampling_noise_threshold: 0.05,
        ..Default::default()
    };
    let mut scheduler = scheduler(
        &config([10, 10], render, WorldSettings::default()),
        constant_color_scene(0.7),
    );

    let mut frames = 0;
    while !scheduler.is_rendering_done() {
        assert!(frames < 16, "adaptive sampling never converged");
        run_frames(&mut scheduler, 1);
        frames += 1;
    }
    assert!(!scheduler.status().still_one_ray_active);

    let counts = scheduler.pixel_sample_counts().unwrap().unwrap();
    assert!(counts.iter().all(|&c| c == 4), "{counts:?}");

    // stopped pixels were rescaled to the global sample number
    let sample_number = scheduler.sample_number() as f32;
    for c in scheduler.color_buffer().unwrap() {
        let mean = luminance(&Vector3::from(c)) / sample_number;
        assert!((mean - 0.7).abs() < 1e-4, "{mean}");
    }
}

#[test]
fn constant_environment_is_seen_by_missing_rays() {
    let render = RenderSettings {
        max_bounces: 2,
        ..Default::default()
    };
    let mut scheduler = scheduler(
        &config([8, 8], render, WorldSettings::default()),
        empty_view_scene(),
    );
    scheduler
        .set_environment(Rgba32FImage::from_pixel(16, 8, Rgba([1.0, 1.0, 1.0, 1.0])))
        .unwrap();
    assert!(scheduler.has_environment());
    scheduler.update_world_settings(|world| {
        world.envmap_intensity = 3.0;
        world.envmap_scale_background_intensity = false;
    });

    run_frames(&mut scheduler, 2);
    let background = mean_color(&scheduler);
    assert!((background.x - 1.0).abs() < 1e-4, "{background:?}");

    scheduler.update_world_settings(|world| world.envmap_scale_background_intensity = true);
    assert_eq!(scheduler.phase(), FramePhase::Resetting);
    run_frames(&mut scheduler, 1);
    assert_eq!(scheduler.sample_number(), 1);
    let background = mean_color(&scheduler);
    assert!((background.x - 3.0).abs() < 1e-3, "{background:?}");

    // an empty image drops the environment again
    scheduler.set_environment(Rgba32FImage::new(0, 0)).unwrap();
    assert!(!scheduler.has_environment());
    assert_eq!(
        scheduler.world_settings().ambient_light_type,
        AmbientLightType::Uniform
    );
}

#[test]
fn buffers_outlive_the_frame_that_uses_them() {
    let device = Arc::new(HostDevice::new());
    let config = config([8, 8], RenderSettings::default(), WorldSettings::default());
    let mut scheduler = FrameScheduler::new(device.clone(), &config).unwrap();
    scheduler.upload_scene(utils::cornell_box()).unwrap();
    run_frames(&mut scheduler, 1);
    device.clear_memory_events();

    let hold = device.hold_stream();
    scheduler.render().unwrap();
    assert_eq!(scheduler.phase(), FramePhase::FrameInFlight);
    assert!(!scheduler.is_frame_done().unwrap());
    assert!(matches!(scheduler.render(), Err(RenderError::FrameInFlight)));
    assert!(matches!(
        scheduler.color_buffer(),
        Err(RenderError::FrameInFlight)
    ));

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        hold.release();
    });
    // frees the old frame buffers, which the held launch still references
    scheduler.resize(6, 4).unwrap();
    releaser.join().unwrap();

    let events = device.memory_events();
    assert!(events.iter().any(|e| matches!(e, MemoryEvent::Free { .. })));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, MemoryEvent::Free { in_flight: true, .. })),
        "{events:?}"
    );
    assert_eq!(scheduler.frame_number(), 2);
    assert_eq!(scheduler.color_buffer().unwrap().len(), 24);
}

#[test]
fn failed_scene_swap_keeps_the_previous_scene() {
    let config = config([6, 6], RenderSettings::default(), WorldSettings::default());
    let mut scheduler = scheduler(&config, utils::cornell_box());
    run_frames(&mut scheduler, 1);

    let mut broken = utils::cornell_box();
    broken.vertex_positions[0] = [f32::NAN, 0.0, 0.0];
    assert!(matches!(
        scheduler.upload_scene(broken),
        Err(RenderError::AccelerationStructure(_))
    ));

    assert!(scheduler.has_scene());
    run_frames(&mut scheduler, 1);
    assert_eq!(scheduler.sample_number(), 2);
}

#[test]
fn material_edit_restarts_accumulation() {
    let config = config([6, 6], RenderSettings::default(), WorldSettings::default());
    let mut scheduler = scheduler(&config, utils::cornell_box());
    run_frames(&mut scheduler, 2);

    let dark = vec![Material::diffuse([0.0; 3]); utils::cornell_box().materials.len()];
    scheduler.update_materials(&dark).unwrap();
    assert_eq!(scheduler.phase(), FramePhase::Resetting);
    run_frames(&mut scheduler, 1);
    assert_eq!(scheduler.sample_number(), 1);

    // nothing emits and nothing reflects, only camera rays that escape see the ambient light
    let color = scheduler.color_buffer().unwrap();
    assert!(color.iter().all(|c| c.iter().all(|v| v.is_finite() && *v >= 0.0)));
}

#[test]
fn denoiser_inputs_are_averaged() {
    let render = RenderSettings {
        samples_per_frame: 2,
        ..Default::default()
    };
    let config = config([4, 4], render, WorldSettings::default());
    let mut scheduler = scheduler(&config, utils::cornell_box());
    run_frames(&mut scheduler, 2);

    let inputs = scheduler.denoiser_inputs().unwrap();
    let color = scheduler.color_buffer().unwrap();
    assert_eq!(inputs.sample_number, 4);
    assert_eq!(inputs.resolution, [4, 4]);
    for (averaged, accumulated) in inputs.color.iter().zip(&color) {
        assert!((averaged[0] * 4.0 - accumulated[0]).abs() < 1e-4);
    }
    assert_eq!(inputs.normals.len(), 16);
    assert_eq!(inputs.albedo.len(), 16);
}
