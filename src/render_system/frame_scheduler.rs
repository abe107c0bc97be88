use std::{path::Path, sync::Arc, time::Duration};

use image::{RgbaImage, Rgba32FImage};
use nalgebra::Vector2;
use tracing::{debug, error, info, warn};

use crate::{
    camera::{Camera, CameraMotion, ViewInteractor},
    config::RendererConfig,
    error::{RenderError, Result},
    metrics::{FRAME_TIME_KEY, PerformanceMetrics, SAMPLE_TIME_KEY},
    render_system::{
        device::{
            Backend, ComputeStream, DeviceBuffer, DeviceError, FrameCompletion, RenderView,
            ResolveParams,
        },
        envmap::{DeviceEnvironment, EnvironmentMap},
        frame_buffers::FrameBuffers,
        kernel_compiler::{
            CompiledProgram, CompilerOptions, KernelCompiler, KernelSource, PendingCompile,
            USE_HARDWARE_ACCELERATION,
        },
        scene::{Material, Scene},
        scene_uploader::{DeviceScene, SceneUploader},
        settings::{AmbientLightType, KernelParameters, RenderSettings, WorldSettings},
        status_buffers::{RenderStatus, StatusBuffers},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    FrameInFlight,
    FrameComplete,
    // a reset is pending and happens at the next render
    Resetting,
}

struct InFlightFrame {
    completion: FrameCompletion,
    samples_per_frame: u32,
    low_resolution: bool,
}

/// Averaged buffers handed to an external denoiser between frames.
#[derive(Clone, Debug, PartialEq)]
pub struct DenoiserInputs {
    // accumulated color divided by the sample number
    pub color: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub albedo: Vec<[f32; 3]>,
    pub sample_number: u32,
    pub resolution: [u32; 2],
}

/// Drives the progressive renderer: owns every device allocation, launches one frame at a
/// time on a single compute stream and decides when the accumulation restarts.
pub struct FrameScheduler<B: Backend> {
    device: Arc<B>,
    stream: B::Stream,
    in_flight: Option<InFlightFrame>,

    compiler: KernelCompiler<B>,
    pending_compile: Option<PendingCompile<B>>,
    program: Option<CompiledProgram<B>>,
    use_hardware_acceleration: bool,

    uploader: SceneUploader<B>,
    scene: Option<DeviceScene<B>>,
    environment: Option<DeviceEnvironment<B>>,

    frame_buffers: FrameBuffers<B>,
    status_buffers: StatusBuffers<B>,

    render_settings: RenderSettings,
    world_settings: WorldSettings,
    camera: Camera,

    render_dirty: bool,
    last_status: RenderStatus,
    last_frame_low_resolution: bool,
    last_frame_time: Option<Duration>,
    metrics: PerformanceMetrics,

    // the user's low resolution choice, restored when an interaction ends
    interacting: bool,
    user_low_resolution: bool,
}

impl<B: Backend> FrameScheduler<B> {
    /// Starts compiling the kernel in the background and allocates the frame buffers.
    pub fn new(device: Arc<B>, config: &RendererConfig) -> Result<FrameScheduler<B>> {
        let resolution = [config.resolution[0].max(1), config.resolution[1].max(1)];
        let render_settings = RenderSettings {
            sample_number: 0,
            frame_number: 0,
            ..config.render.clone()
        };
        let mut world_settings = config.world.clone();
        if world_settings.ambient_light_type == AmbientLightType::Envmap {
            warn!("no environment map loaded yet, using uniform ambient light");
            world_settings.ambient_light_type = AmbientLightType::Uniform;
        }

        let info = device.info();
        let use_hardware_acceleration = info.supports_hardware_acceleration;
        info!(
            device = %info.name,
            target = %info.target,
            hardware_acceleration = use_hardware_acceleration,
            width = resolution[0],
            height = resolution[1],
            "creating frame scheduler"
        );

        let compiler = KernelCompiler::new(device.clone(), config.kernel_cache());
        let options = compiler_options(&render_settings, use_hardware_acceleration);
        let pending_compile = compiler.spawn(KernelSource::path_tracer(), options)?;

        let stream = device.create_stream()?;
        let frame_buffers = FrameBuffers::new(
            device.clone(),
            resolution,
            render_settings.has_access_to_adaptive_sampling_buffers(),
        )?;
        let status_buffers = StatusBuffers::new(&*device)?;

        let mut camera = Camera::default();
        camera.set_resolution(resolution[0], resolution[1]);

        Ok(FrameScheduler {
            uploader: SceneUploader::new(device.clone(), config.accel_build_flags),
            device,
            stream,
            in_flight: None,
            compiler,
            pending_compile: Some(pending_compile),
            program: None,
            use_hardware_acceleration,
            scene: None,
            environment: None,
            frame_buffers,
            status_buffers,
            render_settings,
            world_settings,
            camera,
            render_dirty: true,
            last_status: RenderStatus::default(),
            last_frame_low_resolution: false,
            last_frame_time: None,
            metrics: PerformanceMetrics::default(),
            interacting: false,
            user_low_resolution: config.render.render_low_resolution,
        })
    }

    pub fn device(&self) -> &Arc<B> {
        &self.device
    }

    pub fn phase(&self) -> FramePhase {
        if self.in_flight.is_some() {
            FramePhase::FrameInFlight
        } else if self.render_dirty {
            FramePhase::Resetting
        } else if self.render_settings.frame_number > 0 {
            FramePhase::FrameComplete
        } else {
            FramePhase::Idle
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.in_flight {
            Some(_) => Err(RenderError::FrameInFlight),
            None => Ok(()),
        }
    }

    /// Clears the status counters and brings the adaptive sampling buffers in line with the
    /// settings. Waits for the stream first since both are referenced by in-flight work.
    pub fn prepare_frame(&mut self) -> Result<()> {
        if self.in_flight.is_some() {
            self.synchronize()?;
        }
        self.status_buffers.clear()?;
        let wanted = self.render_settings.has_access_to_adaptive_sampling_buffers();
        if self.frame_buffers.ensure_adaptive(wanted)? {
            self.render_dirty = true;
        }
        Ok(())
    }

    /// Enqueues one frame and returns without waiting for it.
    pub fn render(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.prepare_frame()?;
        if self.render_dirty {
            self.reset()?;
        }
        if let Some(pending) = self.pending_compile.take() {
            self.program = Some(pending.join()?);
        }

        let program = self.program.as_ref().ok_or(RenderError::NoProgram)?;
        let scene = self.scene.as_ref().ok_or(RenderError::NoScene)?;

        let mut params = KernelParameters::new(
            &self.render_settings,
            &self.world_settings,
            self.frame_buffers.resolution(),
            self.frame_buffers.adaptive.is_some(),
        );
        params.triangle_count = scene.triangle_count;
        params.emissive_triangle_count = scene.emissive_triangle_count;
        params.has_texcoords = scene.has_texcoords as u32;
        if let Some(environment) = &self.environment {
            params.envmap_width = environment.width;
            params.envmap_height = environment.height;
        }

        let view = RenderView {
            scene: scene.bindings(),
            environment: self.environment.as_ref().map(|e| e.bindings()),
            frame: self.frame_buffers.bindings(),
            status: self.status_buffers.bindings(),
            camera: self.camera.to_device(),
            params,
        };
        let completion = self.stream.launch(&program.program, view)?;
        self.in_flight = Some(InFlightFrame {
            completion,
            samples_per_frame: params.samples_per_frame,
            low_resolution: params.render_low_resolution != 0,
        });
        Ok(())
    }

    /// Non-blocking. True once the last launched frame has finished, or when nothing is in
    /// flight.
    pub fn is_frame_done(&mut self) -> Result<bool> {
        let Some(frame) = self.in_flight.as_mut() else {
            return Ok(true);
        };
        match frame.completion.poll() {
            Some(_) => {
                // a launch that failed on the device still signals completion
                if let Err(e) = self.stream.query() {
                    return Err(self.abandon_frame(e));
                }
                if let Some(frame) = self.in_flight.take() {
                    self.complete_frame(frame)?;
                }
                Ok(true)
            }
            // surfaces a lost stream instead of polling forever
            None => match self.stream.query() {
                Ok(_) => Ok(false),
                Err(e) => Err(self.abandon_frame(e)),
            },
        }
    }

    /// Blocks until the stream is idle. Required before anything the stream references is
    /// freed, resized or rebound.
    pub fn synchronize(&mut self) -> Result<()> {
        if let Err(e) = self.stream.synchronize() {
            return Err(self.abandon_frame(e));
        }
        if let Some(frame) = self.in_flight.take() {
            self.complete_frame(frame)?;
        }
        Ok(())
    }

    // The failed frame never reaches the counters; whatever it wrote is discarded by the
    // next reset.
    fn abandon_frame(&mut self, e: DeviceError) -> RenderError {
        if self.in_flight.take().is_some() {
            error!(
                error = %e,
                frame = self.render_settings.frame_number,
                "frame failed on the device"
            );
            self.render_dirty = true;
        }
        e.into()
    }

    fn complete_frame(&mut self, frame: InFlightFrame) -> Result<()> {
        let InFlightFrame {
            completion,
            samples_per_frame,
            low_resolution,
        } = frame;
        // the stream has finished, so this does not block
        let elapsed = completion.wait();

        let status = self.status_buffers.read_back()?;
        if status.invalid_sample_count > 0 {
            warn!(
                invalid_samples = status.invalid_sample_count,
                frame = self.render_settings.frame_number,
                "discarded samples with negative or non-finite radiance"
            );
        }

        self.render_settings.sample_number += samples_per_frame;
        self.render_settings.frame_number += 1;
        self.last_status = status;
        self.last_frame_low_resolution = low_resolution;

        if let Some(elapsed) = elapsed {
            let ms = elapsed.as_secs_f64() * 1000.0;
            self.last_frame_time = Some(elapsed);
            self.metrics.add_value(FRAME_TIME_KEY, ms);
            self.metrics
                .add_value(SAMPLE_TIME_KEY, ms / samples_per_frame.max(1) as f64);
        }
        debug!(
            sample_number = self.render_settings.sample_number,
            frame = self.render_settings.frame_number,
            converged = status.pixel_converged_count,
            still_active = status.still_one_ray_active,
            "frame complete"
        );
        Ok(())
    }

    /// Restarts the accumulation. The kernel zeroes every accumulator when it sees sample
    /// number 0.
    pub fn reset(&mut self) -> Result<()> {
        if self.in_flight.is_some() {
            self.synchronize()?;
        }
        self.render_settings.sample_number = 0;
        self.render_settings.frame_number = 0;
        self.last_status = RenderStatus::default();
        self.last_frame_time = None;
        self.metrics.clear();
        self.render_dirty = false;
        debug!("reset accumulation");
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.render_dirty = true;
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let resolution = [width.max(1), height.max(1)];
        if resolution == self.frame_buffers.resolution() {
            return Ok(());
        }
        self.synchronize()?;
        self.frame_buffers.resize(resolution)?;
        self.camera.set_resolution(resolution[0], resolution[1]);
        self.render_dirty = true;
        info!(width = resolution[0], height = resolution[1], "resized renderer");
        Ok(())
    }

    pub fn resolution(&self) -> [u32; 2] {
        self.frame_buffers.resolution()
    }

    /// Uploads and swaps in a new scene. On failure the previous scene stays in place.
    pub fn upload_scene(&mut self, mut scene: Scene) -> Result<()> {
        let device_scene = self.uploader.upload(&mut scene)?;
        self.synchronize()?;
        let previous = self.scene.replace(device_scene);
        drop(previous);

        if let Some(camera) = scene.camera.take() {
            let [width, height] = self.frame_buffers.resolution();
            self.camera = camera;
            self.camera.set_resolution(width, height);
        }
        self.render_dirty = true;
        Ok(())
    }

    pub fn has_scene(&self) -> bool {
        self.scene.is_some()
    }

    /// Rewrites the material table of the current scene and restarts the accumulation.
    pub fn update_materials(&mut self, materials: &[Material]) -> Result<()> {
        self.synchronize()?;
        let scene = self.scene.as_mut().ok_or(RenderError::NoScene)?;
        self.uploader.update_materials(scene, materials)?;
        self.render_dirty = true;
        Ok(())
    }

    /// An empty image removes the environment and falls back to uniform ambient light.
    pub fn set_environment(&mut self, image: Rgba32FImage) -> Result<()> {
        let Some(map) = EnvironmentMap::new(image) else {
            warn!("empty environment map, falling back to uniform ambient light");
            self.synchronize()?;
            self.environment = None;
            if self.world_settings.ambient_light_type == AmbientLightType::Envmap {
                self.world_settings.ambient_light_type = AmbientLightType::Uniform;
            }
            self.render_dirty = true;
            return Ok(());
        };

        let environment = DeviceEnvironment::upload(&*self.device, &map)?;
        self.synchronize()?;
        self.environment = Some(environment);
        self.world_settings.ambient_light_type = AmbientLightType::Envmap;
        self.render_dirty = true;
        info!(width = map.width(), height = map.height(), "loaded environment map");
        Ok(())
    }

    pub fn load_environment(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let image = image::open(path.as_ref())?.into_rgba32f();
        self.set_environment(image)
    }

    pub fn has_environment(&self) -> bool {
        self.environment.is_some()
    }

    /// Compiles the kernel for the current strategies on the calling thread.
    pub fn recompile(&mut self) -> Result<()> {
        self.synchronize()?;
        if let Some(pending) = self.pending_compile.take() {
            // superseded by the compile below
            if let Err(e) = pending.join() {
                warn!(error = %e, "background kernel compile failed");
            }
        }
        let options = compiler_options(&self.render_settings, self.use_hardware_acceleration);
        self.program = Some(self.compiler.compile(&KernelSource::path_tracer(), &options)?);
        self.render_dirty = true;
        Ok(())
    }

    pub fn uses_hardware_acceleration(&self) -> bool {
        self.use_hardware_acceleration
    }

    pub fn set_hardware_acceleration(&mut self, enabled: bool) -> Result<()> {
        let enabled = if enabled && !self.device.info().supports_hardware_acceleration {
            warn!("device has no hardware acceleration, keeping the triangle loop");
            false
        } else {
            enabled
        };
        if enabled == self.use_hardware_acceleration {
            return Ok(());
        }
        self.use_hardware_acceleration = enabled;
        self.recompile()
    }

    pub fn compiled_program(&self) -> Option<&CompiledProgram<B>> {
        self.program.as_ref()
    }

    /// Applies `update` to the render settings. Changes that alter the image restart the
    /// accumulation; strategy changes recompile the kernel.
    pub fn update_render_settings(
        &mut self,
        update: impl FnOnce(&mut RenderSettings),
    ) -> Result<()> {
        let before = self.render_settings.clone();
        let mut next = before.clone();
        update(&mut next);
        next.sample_number = before.sample_number;
        next.frame_number = before.frame_number;
        self.user_low_resolution = next.render_low_resolution;
        if self.interacting {
            next.render_low_resolution = true;
        }

        let strategies_changed = next.light_sampling != before.light_sampling
            || next.envmap_sampling != before.envmap_sampling;
        let dirty = before.affects_image(&next);
        self.render_settings = next;

        if strategies_changed {
            info!(
                light_sampling = ?self.render_settings.light_sampling,
                envmap_sampling = ?self.render_settings.envmap_sampling,
                "sampling strategy changed, recompiling kernel"
            );
            self.recompile()?;
        }
        if dirty {
            self.render_dirty = true;
        }
        Ok(())
    }

    pub fn update_world_settings(&mut self, update: impl FnOnce(&mut WorldSettings)) {
        let mut next = self.world_settings.clone();
        update(&mut next);
        if next.ambient_light_type == AmbientLightType::Envmap && self.environment.is_none() {
            warn!("no environment map loaded, using uniform ambient light");
            next.ambient_light_type = AmbientLightType::Uniform;
        }
        if next != self.world_settings {
            self.world_settings = next;
            self.render_dirty = true;
        }
    }

    pub fn render_settings(&self) -> &RenderSettings {
        &self.render_settings
    }

    pub fn world_settings(&self) -> &WorldSettings {
        &self.world_settings
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// The aspect ratio always follows the frame buffers.
    pub fn set_camera(&mut self, camera: Camera) {
        let [width, height] = self.frame_buffers.resolution();
        self.camera = camera;
        self.camera.set_resolution(width, height);
        self.render_dirty = true;
    }

    pub fn apply_camera_motion(&mut self, motion: CameraMotion) {
        self.camera.apply_motion(motion);
        self.render_dirty = true;
    }

    /// Forces low resolution rendering while an interaction lasts.
    pub fn update_interaction(&mut self, interacting: bool) {
        if interacting == self.interacting {
            return;
        }
        self.interacting = interacting;
        let low_resolution = if interacting {
            self.user_low_resolution = self.render_settings.render_low_resolution;
            true
        } else {
            self.user_low_resolution
        };
        if low_resolution != self.render_settings.render_low_resolution {
            self.render_settings.render_low_resolution = low_resolution;
            self.render_dirty = true;
        }
    }

    pub fn is_interacting(&self) -> bool {
        self.interacting
    }

    /// Feeds a pointer movement through `interactor` and applies the resulting motion.
    pub fn pointer_moved(&mut self, interactor: &mut dyn ViewInteractor, delta: Vector2<f32>) {
        let motion = interactor.pointer_delta(delta);
        self.update_interaction(interactor.is_interacting());
        if let Some(motion) = motion {
            self.apply_camera_motion(motion);
        }
    }

    pub fn scrolled(&mut self, interactor: &mut dyn ViewInteractor, lines: f32) {
        if let Some(motion) = interactor.scrolled(lines) {
            self.apply_camera_motion(motion);
        }
    }

    pub fn sample_number(&self) -> u32 {
        self.render_settings.sample_number
    }

    pub fn frame_number(&self) -> u32 {
        self.render_settings.frame_number
    }

    pub fn status(&self) -> RenderStatus {
        self.last_status
    }

    pub fn was_last_frame_low_resolution(&self) -> bool {
        self.last_frame_low_resolution
    }

    pub fn last_frame_time(&self) -> Option<Duration> {
        self.last_frame_time
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Per-pixel samples accumulated per second, averaged over the metrics window.
    pub fn samples_per_second(&self) -> Option<f64> {
        self.metrics
            .average(SAMPLE_TIME_KEY)
            .filter(|&ms| ms > 0.0)
            .map(|ms| 1000.0 / ms)
    }

    /// True once further frames cannot change the image: the sample cap is reached, every
    /// pixel stopped sampling, or enough pixels fell below the noise-stop threshold.
    pub fn is_rendering_done(&self) -> bool {
        let settings = &self.render_settings;
        if settings.max_samples > 0 && settings.sample_number >= settings.max_samples {
            return true;
        }
        if settings.frame_number == 0 || self.render_dirty || self.last_frame_low_resolution {
            return false;
        }
        if settings.enable_adaptive_sampling && !self.last_status.still_one_ray_active {
            return true;
        }
        if settings.enable_noise_stop {
            let [width, height] = self.frame_buffers.resolution();
            let pixels = width as f64 * height as f64;
            let converged = self.last_status.pixel_converged_count as f64;
            return converged >= settings.noise_stop_converged_proportion as f64 * pixels;
        }
        false
    }

    pub fn color_buffer(&self) -> Result<Vec<[f32; 3]>> {
        self.ensure_idle()?;
        Ok(self.frame_buffers.color.read()?)
    }

    pub fn denoiser_normals(&self) -> Result<Vec<[f32; 3]>> {
        self.ensure_idle()?;
        Ok(self.frame_buffers.denoiser_normals.read()?)
    }

    pub fn denoiser_albedo(&self) -> Result<Vec<[f32; 3]>> {
        self.ensure_idle()?;
        Ok(self.frame_buffers.denoiser_albedo.read()?)
    }

    /// `None` while neither adaptive sampling nor the noise stop is enabled.
    pub fn pixel_sample_counts(&self) -> Result<Option<Vec<u32>>> {
        self.ensure_idle()?;
        match &self.frame_buffers.adaptive {
            Some(adaptive) => Ok(Some(adaptive.sample_counts.read()?)),
            None => Ok(None),
        }
    }

    pub fn squared_luminance(&self) -> Result<Option<Vec<f32>>> {
        self.ensure_idle()?;
        match &self.frame_buffers.adaptive {
            Some(adaptive) => Ok(Some(adaptive.squared_luminance.read()?)),
            None => Ok(None),
        }
    }

    pub fn denoiser_inputs(&self) -> Result<DenoiserInputs> {
        let sample_number = self.render_settings.sample_number;
        let scale = 1.0 / sample_number.max(1) as f32;
        let color = self
            .color_buffer()?
            .into_iter()
            .map(|c| [c[0] * scale, c[1] * scale, c[2] * scale])
            .collect();
        Ok(DenoiserInputs {
            color,
            normals: self.denoiser_normals()?,
            albedo: self.denoiser_albedo()?,
            sample_number,
            resolution: self.frame_buffers.resolution(),
        })
    }

    /// Converts the accumulation into a displayable sRGB image.
    pub fn resolve_display(&self, exposure: f32) -> Result<RgbaImage> {
        self.ensure_idle()?;
        let [width, height] = self.frame_buffers.resolution();
        let block_size = if self.last_frame_low_resolution {
            self.render_settings.low_resolution_scaling.max(1)
        } else {
            1
        };
        let pixels = self.device.resolve_display(
            &self.frame_buffers.color,
            ResolveParams {
                width,
                height,
                sample_number: self.render_settings.sample_number,
                exposure,
                block_size,
            },
        )?;
        let actual = pixels.len();
        let bytes = pixels.into_iter().flatten().collect::<Vec<u8>>();
        RgbaImage::from_raw(width, height, bytes).ok_or_else(|| {
            DeviceError::LengthMismatch {
                expected: width as usize * height as usize,
                actual,
            }
            .into()
        })
    }
}

impl<B: Backend> Drop for FrameScheduler<B> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.synchronize() {
            warn!(error = %e, "compute stream failed while shutting down");
        }
    }
}

fn compiler_options(settings: &RenderSettings, use_hardware_acceleration: bool) -> CompilerOptions {
    let mut options = CompilerOptions::default();
    settings.apply_compiler_macros(&mut options);
    options.set_macro(USE_HARDWARE_ACCELERATION, use_hardware_acceleration as i32);
    options
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::{
        render_system::{device::host::HostDevice, settings::LightSamplingStrategy},
        utils,
    };

    fn config(resolution: [u32; 2]) -> RendererConfig {
        RendererConfig {
            resolution,
            disable_kernel_cache: true,
            render: RenderSettings {
                max_bounces: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn scheduler(resolution: [u32; 2]) -> FrameScheduler<HostDevice> {
        let mut scheduler = FrameScheduler::new(Arc::new(HostDevice::new()), &config(resolution)).unwrap();
        scheduler.upload_scene(utils::cornell_box()).unwrap();
        scheduler
    }

    #[test]
    fn render_without_scene_fails() {
        let mut scheduler =
            FrameScheduler::new(Arc::new(HostDevice::new()), &config([4, 4])).unwrap();
        assert!(matches!(scheduler.render(), Err(RenderError::NoScene)));
    }

    #[test]
    fn frames_advance_the_counters() {
        let mut scheduler = scheduler([8, 6]);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
        scheduler
            .update_render_settings(|s| s.samples_per_frame = 2)
            .unwrap();
        for _ in 0..3 {
            scheduler.render().unwrap();
            scheduler.synchronize().unwrap();
        }
        assert_eq!(scheduler.phase(), FramePhase::FrameComplete);
        assert_eq!(scheduler.sample_number(), 6);
        assert_eq!(scheduler.frame_number(), 3);
        assert!(scheduler.last_frame_time().is_some());
        assert_eq!(scheduler.metrics().values(FRAME_TIME_KEY).count(), 3);
        assert!(scheduler.status().still_one_ray_active);
    }

    #[test]
    fn image_affecting_change_resets_on_next_render() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert_eq!(scheduler.sample_number(), 1);

        scheduler.update_render_settings(|s| s.max_bounces = 1).unwrap();
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert_eq!(scheduler.sample_number(), 1);
        assert_eq!(scheduler.frame_number(), 1);
    }

    #[test]
    fn samples_per_frame_change_keeps_accumulating() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        scheduler
            .update_render_settings(|s| s.samples_per_frame = 3)
            .unwrap();
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert_eq!(scheduler.sample_number(), 4);
    }

    #[test]
    fn resize_restarts_and_keeps_aspect() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        scheduler.resize(8, 2).unwrap();
        assert_eq!(scheduler.resolution(), [8, 2]);
        assert_eq!(scheduler.camera().aspect, 4.0);
        assert_eq!(scheduler.color_buffer().unwrap().len(), 16);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
    }

    #[test]
    fn adaptive_buffers_follow_settings() {
        let mut scheduler = scheduler([4, 4]);
        assert_eq!(scheduler.pixel_sample_counts().unwrap(), None);
        scheduler
            .update_render_settings(|s| s.enable_adaptive_sampling = true)
            .unwrap();
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        let counts = scheduler.pixel_sample_counts().unwrap().unwrap();
        assert!(counts.iter().all(|&c| c == 1));

        scheduler
            .update_render_settings(|s| s.enable_adaptive_sampling = false)
            .unwrap();
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert_eq!(scheduler.squared_luminance().unwrap(), None);
    }

    #[test]
    fn interaction_forces_low_resolution() {
        let mut scheduler = scheduler([8, 8]);
        scheduler.update_interaction(true);
        assert!(scheduler.render_settings().render_low_resolution);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert!(scheduler.was_last_frame_low_resolution());
        assert!(!scheduler.is_rendering_done());

        scheduler.update_interaction(false);
        assert!(!scheduler.render_settings().render_low_resolution);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
    }

    #[test]
    fn sample_cap_ends_rendering() {
        let mut scheduler = scheduler([2, 2]);
        scheduler
            .update_render_settings(|s| {
                s.max_samples = 2;
                s.samples_per_frame = 1;
            })
            .unwrap();
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert!(!scheduler.is_rendering_done());
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert!(scheduler.is_rendering_done());
    }

    #[test]
    fn resolved_image_matches_resolution() {
        let mut scheduler = scheduler([5, 3]);
        scheduler.render().unwrap();
        while !scheduler.is_frame_done().unwrap() {
            std::thread::yield_now();
        }
        let image = scheduler.resolve_display(1.0).unwrap();
        assert_eq!(image.dimensions(), (5, 3));
        assert!(image.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn world_settings_without_environment_fall_back() {
        let mut scheduler = scheduler([2, 2]);
        scheduler.update_world_settings(|w| w.ambient_light_type = AmbientLightType::Envmap);
        assert_eq!(
            scheduler.world_settings().ambient_light_type,
            AmbientLightType::Uniform
        );
    }

    #[test]
    fn environment_image_switches_ambient_light() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();

        scheduler
            .set_environment(Rgba32FImage::from_pixel(8, 4, Rgba([2.0, 1.0, 0.5, 1.0])))
            .unwrap();
        assert!(scheduler.has_environment());
        assert_eq!(
            scheduler.world_settings().ambient_light_type,
            AmbientLightType::Envmap
        );
        assert_eq!(scheduler.phase(), FramePhase::Resetting);

        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert_eq!(scheduler.sample_number(), 1);
        assert!(
            scheduler
                .color_buffer()
                .unwrap()
                .iter()
                .all(|c| c.iter().all(|v| v.is_finite()))
        );
    }

    #[test]
    fn hardware_acceleration_toggle_recompiles() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert!(scheduler.uses_hardware_acceleration());
        let bvh_key = scheduler.compiled_program().unwrap().cache_key.clone();

        scheduler.set_hardware_acceleration(false).unwrap();
        assert!(!scheduler.uses_hardware_acceleration());
        let program = scheduler.compiled_program().unwrap();
        assert_ne!(program.cache_key, bvh_key);
        assert!(!program.program.config.use_hardware_acceleration);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);

        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        assert_eq!(scheduler.sample_number(), 1);
    }

    #[test]
    fn light_sampling_change_recompiles() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        let key = scheduler.compiled_program().unwrap().cache_key.clone();

        scheduler
            .update_render_settings(|s| {
                s.light_sampling = LightSamplingStrategy::NoDirectLightSampling
            })
            .unwrap();
        let program = scheduler.compiled_program().unwrap();
        assert_ne!(program.cache_key, key);
        assert_eq!(
            program.program.config.light_sampling,
            LightSamplingStrategy::NoDirectLightSampling
        );
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
    }

    #[test]
    fn recompile_waits_for_the_frame_in_flight() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        assert_eq!(scheduler.phase(), FramePhase::FrameInFlight);

        scheduler.recompile().unwrap();
        assert!(scheduler.is_frame_done().unwrap());
        assert_eq!(scheduler.frame_number(), 1);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
        assert!(!scheduler.compiled_program().unwrap().from_cache);
    }

    // a color buffer shorter than the frame makes the host launch fail
    fn break_color_buffer(scheduler: &mut FrameScheduler<HostDevice>) {
        scheduler.frame_buffers.color = scheduler.device.alloc(1).unwrap();
    }

    #[test]
    fn failed_launch_is_not_counted_when_polled() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        break_color_buffer(&mut scheduler);

        scheduler.render().unwrap();
        let result = loop {
            match scheduler.is_frame_done() {
                Ok(false) => std::thread::yield_now(),
                other => break other,
            }
        };
        assert!(matches!(
            result,
            Err(RenderError::Device(DeviceError::StreamLost))
        ));
        assert_eq!(scheduler.sample_number(), 1);
        assert_eq!(scheduler.frame_number(), 1);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
        assert!(scheduler.is_frame_done().unwrap());
    }

    #[test]
    fn failed_launch_is_not_counted_when_synchronized() {
        let mut scheduler = scheduler([4, 4]);
        scheduler.render().unwrap();
        scheduler.synchronize().unwrap();
        break_color_buffer(&mut scheduler);

        scheduler.render().unwrap();
        assert!(matches!(
            scheduler.synchronize(),
            Err(RenderError::Device(DeviceError::StreamLost))
        ));
        assert_eq!(scheduler.sample_number(), 1);
        assert_eq!(scheduler.frame_number(), 1);
        assert_eq!(scheduler.phase(), FramePhase::Resetting);
        assert!(matches!(
            scheduler.render(),
            Err(RenderError::Device(DeviceError::StreamLost))
        ));
    }
}
