use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Instant};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use progressive_path_tracer::{
    config::RendererConfig,
    render_system::{
        device::{
            Backend,
            host::{HostDevice, HostDeviceOptions},
        },
        frame_scheduler::FrameScheduler,
        settings::AmbientLightType,
    },
    utils,
};

// used when neither the config nor the command line caps the sample count
const DEFAULT_SAMPLE_TARGET: u32 = 64;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendChoice {
    /// Software path tracer on the CPU.
    Host,
    /// GPU path tracer through Vulkan compute.
    #[cfg(feature = "vulkan")]
    Vulkan,
}

/// Renders the built-in Cornell box progressively and writes the result as a PNG.
#[derive(Parser, Debug)]
#[command(name = "progressive-path-tracer", version)]
struct Cli {
    /// Renderer configuration JSON; command line flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output PNG path.
    #[arg(long, short, default_value = "render.png")]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = BackendChoice::Host)]
    backend: BackendChoice,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Stop after this many samples per pixel.
    #[arg(long)]
    samples: Option<u32>,

    #[arg(long)]
    samples_per_frame: Option<u32>,

    #[arg(long)]
    max_bounces: Option<u32>,

    /// Stop sampling pixels whose confidence interval is below the noise threshold.
    #[arg(long)]
    adaptive: bool,

    /// Equirectangular HDR image used as ambient light.
    #[arg(long)]
    environment: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    exposure: f32,

    #[arg(long)]
    kernel_cache_dir: Option<PathBuf>,

    #[arg(long)]
    no_kernel_cache: bool,

    /// Worker threads of the host backend, 0 for every core.
    #[arg(long)]
    threads: Option<usize>,
}

impl Cli {
    fn renderer_config(&self) -> anyhow::Result<RendererConfig> {
        let mut config = match &self.config {
            Some(path) => RendererConfig::from_json_file(path)
                .with_context(|| format!("load config '{}'", path.display()))?,
            None => RendererConfig::default(),
        };
        if let Some(width) = self.width {
            config.resolution[0] = width;
        }
        if let Some(height) = self.height {
            config.resolution[1] = height;
        }
        if let Some(samples) = self.samples {
            config.render.max_samples = samples;
        } else if config.render.max_samples == 0 {
            config.render.max_samples = DEFAULT_SAMPLE_TARGET;
        }
        if let Some(samples_per_frame) = self.samples_per_frame {
            config.render.samples_per_frame = samples_per_frame;
        }
        if let Some(max_bounces) = self.max_bounces {
            config.render.max_bounces = max_bounces;
        }
        if self.adaptive {
            config.render.enable_adaptive_sampling = true;
        }
        if self.kernel_cache_dir.is_some() {
            config.kernel_cache_dir = self.kernel_cache_dir.clone();
        }
        if self.no_kernel_cache {
            config.disable_kernel_cache = true;
        }
        if let Some(threads) = self.threads {
            config.host_worker_threads = threads;
        }
        Ok(config)
    }
}

fn render<B: Backend>(device: Arc<B>, cli: &Cli, config: &RendererConfig) -> anyhow::Result<()> {
    let mut scheduler = FrameScheduler::new(device, config)?;
    scheduler.upload_scene(utils::cornell_box())?;

    if let Some(path) = &cli.environment {
        scheduler
            .load_environment(path)
            .with_context(|| format!("load environment '{}'", path.display()))?;
        scheduler.update_world_settings(|world| world.ambient_light_type = AmbientLightType::Envmap);
    }

    let start = Instant::now();
    while !scheduler.is_rendering_done() {
        scheduler.prepare_frame()?;
        scheduler.render()?;
        scheduler.synchronize()?;

        let frame = scheduler.frame_number();
        if frame % 16 == 0 {
            info!(
                frame,
                samples = scheduler.sample_number(),
                samples_per_second = scheduler.samples_per_second().unwrap_or(0.0),
                converged_pixels = scheduler.status().pixel_converged_count,
                "progress"
            );
        }
    }
    info!(
        samples = scheduler.sample_number(),
        frames = scheduler.frame_number(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "rendering done"
    );

    let image = scheduler.resolve_display(cli.exposure)?;
    image
        .save(&cli.output)
        .with_context(|| format!("write '{}'", cli.output.display()))?;
    info!(path = %cli.output.display(), "saved image");
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.renderer_config()?;
    match cli.backend {
        BackendChoice::Host => {
            let device = HostDevice::with_options(HostDeviceOptions {
                worker_threads: config.host_worker_threads,
            })?;
            render(Arc::new(device), &cli, &config)
        }
        #[cfg(feature = "vulkan")]
        BackendChoice::Vulkan => {
            let device =
                progressive_path_tracer::render_system::device::vulkan::VulkanDevice::new()?;
            render(Arc::new(device), &cli, &config)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
