use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::render_system::kernel_compiler::{
    CompilerOptions, DIRECT_LIGHT_SAMPLING_STRATEGY, ENVMAP_SAMPLING_STRATEGY,
};

/// How direct lighting from emissive triangles is estimated at each path vertex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightSamplingStrategy {
    /// Emission is only picked up when a BSDF-sampled ray hits an emitter.
    NoDirectLightSampling,
    /// One emissive triangle is picked uniformly and sampled uniformly by area.
    #[default]
    UniformOneLight,
}

impl LightSamplingStrategy {
    pub fn macro_value(self) -> i32 {
        match self {
            LightSamplingStrategy::NoDirectLightSampling => 0,
            LightSamplingStrategy::UniformOneLight => 1,
        }
    }

    pub fn from_macro_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(LightSamplingStrategy::NoDirectLightSampling),
            1 => Some(LightSamplingStrategy::UniformOneLight),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvmapSamplingStrategy {
    NoSampling,
    /// importance sampling through the luminance CDF of the environment image
    #[default]
    Cdf,
}

impl EnvmapSamplingStrategy {
    pub fn macro_value(self) -> i32 {
        match self {
            EnvmapSamplingStrategy::NoSampling => 0,
            EnvmapSamplingStrategy::Cdf => 1,
        }
    }

    pub fn from_macro_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(EnvmapSamplingStrategy::NoSampling),
            1 => Some(EnvmapSamplingStrategy::Cdf),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientLightType {
    None,
    #[default]
    Uniform,
    Envmap,
}

impl AmbientLightType {
    fn device_value(self) -> u32 {
        match self {
            AmbientLightType::None => 0,
            AmbientLightType::Uniform => 1,
            AmbientLightType::Envmap => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    // number of samples accumulated in the color buffer so far
    #[serde(skip)]
    pub sample_number: u32,
    // number of completed frames since the last reset
    #[serde(skip)]
    pub frame_number: u32,

    pub samples_per_frame: u32,
    pub max_bounces: u32,
    // 0 means no cap
    pub max_samples: u32,

    pub enable_adaptive_sampling: bool,
    pub adaptive_sampling_min_samples: u32,
    pub adaptive_sampling_noise_threshold: f32,

    // stop the whole render once enough pixels are below this noise level
    pub enable_noise_stop: bool,
    pub noise_stop_threshold: f32,
    pub noise_stop_converged_proportion: f32,

    pub render_low_resolution: bool,
    pub low_resolution_scaling: u32,

    pub freeze_random: bool,
    pub display_nans: bool,

    pub light_sampling: LightSamplingStrategy,
    pub envmap_sampling: EnvmapSamplingStrategy,
}

impl Default for RenderSettings {
    fn default() -> RenderSettings {
        RenderSettings {
            sample_number: 0,
            frame_number: 0,
            samples_per_frame: 1,
            max_bounces: 8,
            max_samples: 4096,
            enable_adaptive_sampling: false,
            adaptive_sampling_min_samples: 8,
            adaptive_sampling_noise_threshold: 0.1,
            enable_noise_stop: false,
            noise_stop_threshold: 0.05,
            noise_stop_converged_proportion: 0.9,
            render_low_resolution: false,
            low_resolution_scaling: 2,
            freeze_random: false,
            display_nans: false,
            light_sampling: LightSamplingStrategy::default(),
            envmap_sampling: EnvmapSamplingStrategy::default(),
        }
    }
}

/// Bounce cap applied while rendering in low resolution mode.
pub const LOW_RESOLUTION_MAX_BOUNCES: u32 = 3;
/// Samples-per-frame cap applied while rendering in low resolution mode.
pub const LOW_RESOLUTION_SAMPLES_PER_FRAME: u32 = 1;

impl RenderSettings {
    /// The per-pixel sample-count and squared-luminance buffers are only allocated when
    /// something reads them.
    pub fn has_access_to_adaptive_sampling_buffers(&self) -> bool {
        self.enable_adaptive_sampling || self.enable_noise_stop
    }

    pub fn effective_samples_per_frame(&self) -> u32 {
        if self.render_low_resolution {
            self.samples_per_frame.min(LOW_RESOLUTION_SAMPLES_PER_FRAME)
        } else {
            self.samples_per_frame
        }
    }

    pub fn effective_max_bounces(&self) -> u32 {
        if self.render_low_resolution {
            self.max_bounces.min(LOW_RESOLUTION_MAX_BOUNCES)
        } else {
            self.max_bounces
        }
    }

    /// True when going from `self` to `other` changes the rendered image, i.e. the
    /// accumulation has to restart. The sample/frame counters are not settings.
    pub fn affects_image(&self, other: &RenderSettings) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.sample_number = 0;
        a.frame_number = 0;
        b.sample_number = 0;
        b.frame_number = 0;
        // how many samples a frame takes does not change the estimate
        a.samples_per_frame = 0;
        b.samples_per_frame = 0;
        a.max_samples = 0;
        b.max_samples = 0;
        a != b
    }

    /// Sampling strategies are compile-time switches of the kernel.
    pub fn apply_compiler_macros(&self, options: &mut CompilerOptions) {
        options.set_macro(
            DIRECT_LIGHT_SAMPLING_STRATEGY,
            self.light_sampling.macro_value(),
        );
        options.set_macro(ENVMAP_SAMPLING_STRATEGY, self.envmap_sampling.macro_value());
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub ambient_light_type: AmbientLightType,
    pub uniform_light_color: [f32; 3],
    pub envmap_intensity: f32,
    // when false, camera rays that miss see the environment without the intensity multiplier
    pub envmap_scale_background_intensity: bool,
}

impl Default for WorldSettings {
    fn default() -> WorldSettings {
        WorldSettings {
            ambient_light_type: AmbientLightType::Uniform,
            uniform_light_color: [0.5, 0.5, 0.5],
            envmap_intensity: 1.0,
            envmap_scale_background_intensity: false,
        }
    }
}

/// Device form of the per-frame settings. Shared verbatim between the host kernel and the
/// GLSL kernel's parameter block (scalar layout).
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct KernelParameters {
    pub width: u32,
    pub height: u32,
    pub sample_number: u32,
    pub frame_number: u32,
    pub samples_per_frame: u32,
    pub max_bounces: u32,
    pub max_samples: u32,
    pub enable_adaptive_sampling: u32,
    pub adaptive_sampling_min_samples: u32,
    pub adaptive_sampling_noise_threshold: f32,
    pub enable_noise_stop: u32,
    pub noise_stop_threshold: f32,
    pub render_low_resolution: u32,
    pub low_resolution_scaling: u32,
    pub freeze_random: u32,
    pub display_nans: u32,
    pub has_adaptive_buffers: u32,
    pub ambient_light_type: u32,
    pub uniform_light_color: [f32; 3],
    pub envmap_intensity: f32,
    pub envmap_scale_background_intensity: u32,
    pub envmap_width: u32,
    pub envmap_height: u32,
    pub emissive_triangle_count: u32,
    pub triangle_count: u32,
    pub has_texcoords: u32,
}

impl KernelParameters {
    pub fn new(
        render: &RenderSettings,
        world: &WorldSettings,
        resolution: [u32; 2],
        has_adaptive_buffers: bool,
    ) -> KernelParameters {
        KernelParameters {
            width: resolution[0],
            height: resolution[1],
            sample_number: render.sample_number,
            frame_number: render.frame_number,
            samples_per_frame: render.effective_samples_per_frame(),
            max_bounces: render.effective_max_bounces(),
            max_samples: render.max_samples,
            enable_adaptive_sampling: render.enable_adaptive_sampling as u32,
            adaptive_sampling_min_samples: render.adaptive_sampling_min_samples,
            adaptive_sampling_noise_threshold: render.adaptive_sampling_noise_threshold,
            enable_noise_stop: render.enable_noise_stop as u32,
            noise_stop_threshold: render.noise_stop_threshold,
            render_low_resolution: render.render_low_resolution as u32,
            low_resolution_scaling: render.low_resolution_scaling.max(1),
            freeze_random: render.freeze_random as u32,
            display_nans: render.display_nans as u32,
            has_adaptive_buffers: has_adaptive_buffers as u32,
            ambient_light_type: world.ambient_light_type.device_value(),
            uniform_light_color: world.uniform_light_color,
            envmap_intensity: world.envmap_intensity,
            envmap_scale_background_intensity: world.envmap_scale_background_intensity as u32,
            ..Default::default()
        }
    }

    pub fn ambient_light_type(&self) -> AmbientLightType {
        match self.ambient_light_type {
            1 => AmbientLightType::Uniform,
            2 => AmbientLightType::Envmap,
            _ => AmbientLightType::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: RenderSettings =
            serde_json::from_str(r#"{ "max_bounces": 2, "light_sampling": "no_direct_light_sampling" }"#)
                .unwrap();
        assert_eq!(settings.max_bounces, 2);
        assert_eq!(
            settings.light_sampling,
            LightSamplingStrategy::NoDirectLightSampling
        );
        assert_eq!(settings.samples_per_frame, 1);
        assert_eq!(settings.envmap_sampling, EnvmapSamplingStrategy::Cdf);
    }

    #[test]
    fn counters_do_not_affect_image() {
        let a = RenderSettings::default();
        let mut b = a.clone();
        b.sample_number = 100;
        b.frame_number = 4;
        b.samples_per_frame = 16;
        assert!(!a.affects_image(&b));
        b.max_bounces = 1;
        assert!(a.affects_image(&b));
    }

    #[test]
    fn low_resolution_caps_bounces_and_samples() {
        let settings = RenderSettings {
            samples_per_frame: 8,
            max_bounces: 12,
            render_low_resolution: true,
            ..Default::default()
        };
        assert_eq!(settings.effective_max_bounces(), 3);
        assert_eq!(settings.effective_samples_per_frame(), 1);

        let params = KernelParameters::new(&settings, &WorldSettings::default(), [4, 4], false);
        assert_eq!(params.max_bounces, 3);
        assert_eq!(params.samples_per_frame, 1);
    }

    #[test]
    fn adaptive_buffers_follow_either_feature() {
        let mut settings = RenderSettings::default();
        assert!(!settings.has_access_to_adaptive_sampling_buffers());
        settings.enable_noise_stop = true;
        assert!(settings.has_access_to_adaptive_sampling_buffers());
        settings.enable_noise_stop = false;
        settings.enable_adaptive_sampling = true;
        assert!(settings.has_access_to_adaptive_sampling_buffers());
    }
}
