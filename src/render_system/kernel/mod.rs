//! Per-pixel progressive path tracing, executed by the host device. The GLSL kernel in
//! `path_trace_shader` mirrors this module statement for statement.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use nalgebra::{Matrix4, Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    camera::DeviceCamera,
    render_system::{
        bvh::{Bvh, Ray, TriangleHit, intersect_triangle},
        device::DeviceError,
        envmap::EnvironmentData,
        kernel_compiler::{
            CompilerOptions, DIRECT_LIGHT_SAMPLING_STRATEGY, ENVMAP_SAMPLING_STRATEGY,
            USE_HARDWARE_ACCELERATION,
        },
        scene::{Material, TextureImage},
        settings::{EnvmapSamplingStrategy, KernelParameters, LightSamplingStrategy},
    },
    utils::luminance,
};

pub mod bsdf;
pub mod lights;
pub mod rng;
pub mod sampling;

use bsdf::SurfaceMaterial;
use rng::{Xorshift32, pixel_seed};

/// Distance new rays are pushed off the surface they start on.
pub const RAY_OFFSET: f32 = 1e-3;

/// Written into a pixel that produced an invalid sample when `display_nans` is set.
pub const NAN_DEBUG_COLOR: [f32; 3] = [1e15, 0.0, 1e15];

/// Compile-time switches of the kernel, resolved from the compiler macros.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub light_sampling: LightSamplingStrategy,
    pub envmap_sampling: EnvmapSamplingStrategy,
    pub use_hardware_acceleration: bool,
}

impl Default for KernelConfig {
    fn default() -> KernelConfig {
        KernelConfig {
            light_sampling: LightSamplingStrategy::default(),
            envmap_sampling: EnvmapSamplingStrategy::default(),
            use_hardware_acceleration: true,
        }
    }
}

impl KernelConfig {
    pub fn from_options(options: &CompilerOptions) -> Result<KernelConfig, DeviceError> {
        let invalid = |name: &str, value: i32| {
            DeviceError::Compilation(format!("invalid value {value} for macro {name}"))
        };
        let mut config = KernelConfig::default();
        if let Some(value) = options.macro_value(DIRECT_LIGHT_SAMPLING_STRATEGY) {
            config.light_sampling = LightSamplingStrategy::from_macro_value(value)
                .ok_or_else(|| invalid(DIRECT_LIGHT_SAMPLING_STRATEGY, value))?;
        }
        if let Some(value) = options.macro_value(ENVMAP_SAMPLING_STRATEGY) {
            config.envmap_sampling = EnvmapSamplingStrategy::from_macro_value(value)
                .ok_or_else(|| invalid(ENVMAP_SAMPLING_STRATEGY, value))?;
        }
        if let Some(value) = options.macro_value(USE_HARDWARE_ACCELERATION) {
            config.use_hardware_acceleration = match value {
                0 => false,
                1 => true,
                _ => return Err(invalid(USE_HARDWARE_ACCELERATION, value)),
            };
        }
        Ok(config)
    }
}

/// Scene resources as the kernel reads them.
#[derive(Clone, Copy)]
pub struct SceneData<'a> {
    pub triangle_indices: &'a [u32],
    pub vertex_positions: &'a [[f32; 3]],
    pub has_vertex_normals: &'a [u32],
    pub vertex_normals: &'a [[f32; 3]],
    pub texcoords: &'a [[f32; 2]],
    pub material_indices: &'a [u32],
    pub materials: &'a [Material],
    pub emissive_triangle_indices: &'a [u32],
    pub textures: &'a [Arc<TextureImage>],
    pub accel: &'a Bvh,
}

impl SceneData<'_> {
    pub fn triangle_count(&self) -> usize {
        self.triangle_indices.len() / 3
    }

    fn vertex_indices(&self, triangle: u32) -> [usize; 3] {
        let base = triangle as usize * 3;
        [
            self.triangle_indices[base] as usize,
            self.triangle_indices[base + 1] as usize,
            self.triangle_indices[base + 2] as usize,
        ]
    }

    pub fn triangle(&self, triangle: u32) -> [Point3<f32>; 3] {
        self.vertex_indices(triangle)
            .map(|i| Point3::from(self.vertex_positions[i]))
    }

    pub fn material_of(&self, triangle: u32) -> &Material {
        &self.materials[self.material_indices[triangle as usize] as usize]
    }

    fn texture(&self, index: i32) -> Option<&TextureImage> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.textures.get(i))
            .map(|t| t.as_ref())
    }
}

/// A resolved ray/triangle intersection.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceHit {
    pub position: Point3<f32>,
    pub geometric_normal: Vector3<f32>,
    pub shading_normal: Vector3<f32>,
    pub material: SurfaceMaterial,
    pub triangle: u32,
}

impl SurfaceHit {
    /// Origin for a ray leaving the surface towards `direction`.
    pub fn spawn_origin(&self, direction: &Vector3<f32>) -> Point3<f32> {
        let side = if direction.dot(&self.geometric_normal) >= 0.0 {
            1.0
        } else {
            -1.0
        };
        self.position + self.geometric_normal * (RAY_OFFSET * side)
    }
}

/// Everything a launch shares between pixels.
pub struct KernelContext<'a> {
    pub config: &'a KernelConfig,
    pub scene: SceneData<'a>,
    pub environment: Option<EnvironmentData<'a>>,
    pub params: &'a KernelParameters,
    inverse_view: Matrix4<f32>,
    inverse_projection: Matrix4<f32>,
    camera_position: Point3<f32>,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        config: &'a KernelConfig,
        scene: SceneData<'a>,
        environment: Option<EnvironmentData<'a>>,
        camera: &DeviceCamera,
        params: &'a KernelParameters,
    ) -> KernelContext<'a> {
        KernelContext {
            config,
            scene,
            environment,
            params,
            inverse_view: Matrix4::from(camera.inverse_view),
            inverse_projection: Matrix4::from(camera.inverse_projection),
            camera_position: Point3::from(camera.position),
        }
    }

    /// Primary ray through the (sub)pixel position `(px, py)`.
    pub fn camera_ray(&self, px: f32, py: f32) -> Ray {
        let ndc_x = 2.0 * px / self.params.width as f32 - 1.0;
        let ndc_y = 1.0 - 2.0 * py / self.params.height as f32;
        let near = self
            .inverse_projection
            .transform_point(&Point3::new(ndc_x, ndc_y, -1.0));
        let far = self
            .inverse_projection
            .transform_point(&Point3::new(ndc_x, ndc_y, 1.0));
        let direction = self.inverse_view.transform_vector(&(far - near)).normalize();
        Ray {
            origin: self.camera_position,
            direction,
        }
    }

    pub fn closest_hit(&self, ray: &Ray) -> Option<TriangleHit> {
        if self.config.use_hardware_acceleration {
            return self.scene.accel.closest_hit(ray, 0.0, f32::INFINITY);
        }
        let mut closest: Option<TriangleHit> = None;
        for prim_idx in 0..self.scene.triangle_count() as u32 {
            let t_max = closest.map_or(f32::INFINITY, |h| h.t);
            if let Some((t, u, v)) =
                intersect_triangle(ray, &self.scene.triangle(prim_idx), 0.0, t_max)
            {
                closest = Some(TriangleHit { t, prim_idx, u, v });
            }
        }
        closest
    }

    fn any_hit(&self, ray: &Ray, t_max: f32) -> bool {
        if self.config.use_hardware_acceleration {
            return self.scene.accel.any_hit(ray, 0.0, t_max);
        }
        (0..self.scene.triangle_count() as u32)
            .any(|prim_idx| intersect_triangle(ray, &self.scene.triangle(prim_idx), 0.0, t_max).is_some())
    }

    /// True if anything lies strictly between `origin` and `target`.
    pub fn occluded(&self, origin: &Point3<f32>, target: &Point3<f32>) -> bool {
        let offset = target - origin;
        let dist = offset.norm();
        if dist <= 0.0 {
            return false;
        }
        let ray = Ray {
            origin: *origin,
            direction: offset / dist,
        };
        self.any_hit(&ray, dist * (1.0 - 1e-4))
    }

    pub fn occluded_direction(&self, origin: &Point3<f32>, direction: &Vector3<f32>) -> bool {
        let ray = Ray {
            origin: *origin,
            direction: *direction,
        };
        self.any_hit(&ray, f32::INFINITY)
    }

    fn resolve_hit(&self, ray: &Ray, hit: &TriangleHit) -> SurfaceHit {
        let scene = &self.scene;
        let [i0, i1, i2] = scene.vertex_indices(hit.prim_idx);
        let [p0, p1, p2] = scene.triangle(hit.prim_idx);
        let w = 1.0 - hit.u - hit.v;

        let position = ray.origin + ray.direction * hit.t;
        let geometric_normal = (p1 - p0).cross(&(p2 - p0)).normalize();

        let mut shading_normal = geometric_normal;
        if scene.has_vertex_normals[i0] != 0
            && scene.has_vertex_normals[i1] != 0
            && scene.has_vertex_normals[i2] != 0
        {
            let n = Vector3::from(scene.vertex_normals[i0]) * w
                + Vector3::from(scene.vertex_normals[i1]) * hit.u
                + Vector3::from(scene.vertex_normals[i2]) * hit.v;
            if let Some(n) = n.try_normalize(1e-8) {
                shading_normal = if n.dot(&geometric_normal) < 0.0 { -n } else { n };
            }
        }

        let uv = (!scene.texcoords.is_empty()).then(|| {
            let [a, b, c] = [i0, i1, i2].map(|i| scene.texcoords[i]);
            [
                a[0] * w + b[0] * hit.u + c[0] * hit.v,
                a[1] * w + b[1] * hit.u + c[1] * hit.v,
            ]
        });

        SurfaceHit {
            position,
            geometric_normal,
            shading_normal,
            material: self.surface_material(scene.material_of(hit.prim_idx), uv),
            triangle: hit.prim_idx,
        }
    }

    fn surface_material(&self, material: &Material, uv: Option<[f32; 2]>) -> SurfaceMaterial {
        let mut base_color = Vector3::from(material.base_color);
        let mut roughness = material.roughness;
        let mut metallic = material.metallic;
        if let Some(uv) = uv {
            if let Some(texture) = self.scene.texture(material.base_color_texture) {
                base_color = base_color.component_mul(&texture.sample(uv).xyz());
            }
            if let Some(texture) = self.scene.texture(material.roughness_metallic_texture) {
                let texel = texture.sample(uv);
                roughness *= texel.y;
                metallic *= texel.z;
            }
        }
        SurfaceMaterial {
            base_color,
            emission: Vector3::from(material.emission),
            roughness: roughness.clamp(0.0, 1.0),
            metallic: metallic.clamp(0.0, 1.0),
            specular: material.specular.clamp(0.0, 1.0),
            specular_transmission: material.specular_transmission.clamp(0.0, 1.0),
            ior: material.ior.max(1.0),
        }
    }
}

/// One camera path: radiance plus the first-hit AOVs.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathSample {
    pub radiance: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub albedo: Vector3<f32>,
}

pub(crate) fn trace_sample(
    ctx: &KernelContext,
    x: u32,
    y: u32,
    rng: &mut Xorshift32,
) -> PathSample {
    let jx = x as f32 + rng.next_f32();
    let jy = y as f32 + rng.next_f32();
    let mut ray = ctx.camera_ray(jx, jy);

    let mut sample = PathSample::default();
    let mut throughput = Vector3::repeat(1.0);

    for bounce in 0..ctx.params.max_bounces {
        let Some(hit) = ctx.closest_hit(&ray) else {
            sample.radiance += throughput.component_mul(&ctx.miss_radiance(&ray.direction, bounce));
            break;
        };
        let mut surface = ctx.resolve_hit(&ray, &hit);
        let wo = -ray.direction;

        // opaque and emissive surfaces are two sided, dielectrics keep their orientation
        let transmissive = surface.material.is_transmissive() && !surface.material.is_emissive();
        if !transmissive && surface.geometric_normal.dot(&wo) < 0.0 {
            surface.geometric_normal = -surface.geometric_normal;
            surface.shading_normal = -surface.shading_normal;
        }

        if bounce == 0 {
            sample.normal = surface.shading_normal;
            sample.albedo = surface.material.base_color;
        }

        if bounce == 0 || !ctx.samples_lights() {
            sample.radiance += throughput.component_mul(&surface.material.emission);
        }

        let direct = lights::sample_one_light(ctx, &surface, &wo, rng)
            + lights::sample_environment_map(ctx, &surface, &wo, rng);
        sample.radiance += throughput.component_mul(&direct);

        let Some(scattered) = bsdf::sample(&surface.material, &wo, &surface.shading_normal, rng)
        else {
            break;
        };
        let cos = scattered.direction.dot(&surface.shading_normal).abs();
        throughput = throughput.component_mul(&scattered.value) * (cos / scattered.pdf);

        ray = Ray {
            origin: surface.spawn_origin(&scattered.direction),
            direction: scattered.direction,
        };
    }
    sample
}

/// Per-launch status, reduced into the status buffers after the launch.
#[derive(Debug, Default)]
pub struct StatusCounters {
    pub still_one_ray_active: AtomicU32,
    pub pixel_converged_count: AtomicU32,
    pub invalid_sample_count: AtomicU32,
}

/// Accumulation state of one pixel.
pub struct PixelAccumulators<'a> {
    pub color: &'a mut [f32; 3],
    pub normal: &'a mut [f32; 3],
    pub albedo: &'a mut [f32; 3],
    pub sample_count: Option<&'a mut u32>,
    pub squared_luminance: Option<&'a mut f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Convergence {
    Active,
    // keeps sampling, but counts towards the noise stop
    BelowNoiseStop,
    Stopped,
}

// 95% confidence interval relative to the mean
fn is_below_noise(mean: f32, squared_luminance: f32, count: u32, threshold: f32) -> bool {
    let n = count as f32;
    let variance = (squared_luminance / n - mean * mean).max(0.0);
    let interval = 1.96 * (variance / n).sqrt();
    interval <= threshold * mean
}

fn convergence(
    params: &KernelParameters,
    color: &[f32; 3],
    sample_count: Option<u32>,
    squared_luminance: Option<f32>,
) -> Convergence {
    let pixel_samples = sample_count.unwrap_or(params.sample_number);
    if params.max_samples > 0 && pixel_samples >= params.max_samples {
        return Convergence::Stopped;
    }
    let (Some(count), Some(squared_luminance)) = (sample_count, squared_luminance) else {
        return Convergence::Active;
    };
    if params.sample_number == 0 || count == 0 || count < params.adaptive_sampling_min_samples {
        return Convergence::Active;
    }

    let mean = luminance(&Vector3::from(*color)) / params.sample_number as f32;
    if params.enable_adaptive_sampling != 0
        && is_below_noise(
            mean,
            squared_luminance,
            count,
            params.adaptive_sampling_noise_threshold,
        )
    {
        return Convergence::Stopped;
    }
    if params.enable_noise_stop != 0
        && is_below_noise(mean, squared_luminance, count, params.noise_stop_threshold)
    {
        return Convergence::BelowNoiseStop;
    }
    Convergence::Active
}

fn is_valid(radiance: &Vector3<f32>) -> bool {
    radiance.iter().all(|c| c.is_finite() && *c >= 0.0)
}

/// Adds this frame's samples to one pixel.
pub fn render_pixel(
    ctx: &KernelContext,
    x: u32,
    y: u32,
    acc: PixelAccumulators,
    counters: &StatusCounters,
) {
    let params = ctx.params;
    if params.render_low_resolution != 0 {
        let block = params.low_resolution_scaling.max(1);
        if x % block != 0 || y % block != 0 {
            return;
        }
    }

    let PixelAccumulators {
        color,
        normal,
        albedo,
        mut sample_count,
        mut squared_luminance,
    } = acc;
    let sample_number = params.sample_number;
    let samples_per_frame = params.samples_per_frame;

    if sample_number == 0 {
        *color = [0.0; 3];
        *normal = [0.0; 3];
        *albedo = [0.0; 3];
        if let Some(count) = sample_count.as_deref_mut() {
            *count = 0;
        }
        if let Some(sq) = squared_luminance.as_deref_mut() {
            *sq = 0.0;
        }
    }

    match convergence(
        params,
        color,
        sample_count.as_deref().copied(),
        squared_luminance.as_deref().copied(),
    ) {
        Convergence::Stopped => {
            counters.pixel_converged_count.fetch_add(1, Ordering::Relaxed);
            // the display divides by the global sample number, which still advances
            if sample_number > 0 {
                let scale = (sample_number + samples_per_frame) as f32 / sample_number as f32;
                color.iter_mut().for_each(|c| *c *= scale);
            }
            return;
        }
        Convergence::BelowNoiseStop => {
            counters.pixel_converged_count.fetch_add(1, Ordering::Relaxed);
        }
        Convergence::Active => {}
    }

    let pixel_index = y * params.width + x;
    let mut rng = Xorshift32::new(pixel_seed(
        pixel_index,
        sample_number,
        params.freeze_random != 0,
    ));

    let mut radiance_sum = Vector3::zeros();
    let mut normal_sum = Vector3::zeros();
    let mut albedo_sum = Vector3::zeros();
    let mut squared_luminance_sum = 0.0;
    for _ in 0..samples_per_frame {
        let sample = trace_sample(ctx, x, y, &mut rng);
        if !is_valid(&sample.radiance) {
            counters.invalid_sample_count.fetch_add(1, Ordering::Relaxed);
            if params.display_nans != 0 {
                let scale = (sample_number + samples_per_frame).max(1) as f32;
                *color = NAN_DEBUG_COLOR.map(|c| c * scale);
            }
            return;
        }
        let lum = luminance(&sample.radiance);
        squared_luminance_sum += lum * lum;
        radiance_sum += sample.radiance;
        normal_sum += sample.normal;
        albedo_sum += sample.albedo;
    }

    counters.still_one_ray_active.store(1, Ordering::Relaxed);

    if let (Some(count), Some(sq)) = (sample_count, squared_luminance) {
        *count += samples_per_frame;
        *sq += squared_luminance_sum;
    }
    for c in 0..3 {
        color[c] += radiance_sum[c];
    }

    // AOVs are a running average over frames
    if samples_per_frame > 0 {
        let frames = params.frame_number as f32;
        let spf = samples_per_frame as f32;
        let mut new_normal =
            (Vector3::from(*normal) * frames + normal_sum / spf) / (frames + 1.0);
        if let Some(n) = new_normal.try_normalize(1e-12) {
            new_normal = n;
        }
        let new_albedo = (Vector3::from(*albedo) * frames + albedo_sum / spf) / (frames + 1.0);
        *normal = new_normal.into();
        *albedo = new_albedo.into();
    }
}

/// Frame buffers of one launch, all `width * height` long.
pub struct FrameTargets<'a> {
    pub color: &'a mut [[f32; 3]],
    pub normals: &'a mut [[f32; 3]],
    pub albedo: &'a mut [[f32; 3]],
    pub sample_counts: Option<&'a mut [u32]>,
    pub squared_luminance: Option<&'a mut [f32]>,
}

struct RowTarget<'a> {
    y: u32,
    color: &'a mut [[f32; 3]],
    normals: &'a mut [[f32; 3]],
    albedo: &'a mut [[f32; 3]],
    sample_counts: Option<&'a mut [u32]>,
    squared_luminance: Option<&'a mut [f32]>,
}

/// Runs the kernel over every pixel, rows in parallel.
pub fn render_frame(ctx: &KernelContext, targets: FrameTargets, counters: &StatusCounters) {
    let width = ctx.params.width as usize;
    if width == 0 || ctx.params.height == 0 {
        return;
    }

    let mut count_rows = targets.sample_counts.map(|c| c.chunks_mut(width));
    let mut sq_rows = targets.squared_luminance.map(|s| s.chunks_mut(width));
    let rows: Vec<RowTarget> = targets
        .color
        .chunks_mut(width)
        .zip(targets.normals.chunks_mut(width))
        .zip(targets.albedo.chunks_mut(width))
        .take(ctx.params.height as usize)
        .enumerate()
        .map(|(y, ((color, normals), albedo))| RowTarget {
            y: y as u32,
            color,
            normals,
            albedo,
            sample_counts: count_rows.as_mut().and_then(|rows| rows.next()),
            squared_luminance: sq_rows.as_mut().and_then(|rows| rows.next()),
        })
        .collect();

    rows.into_par_iter().for_each(|mut row| {
        for x in 0..row.color.len() {
            render_pixel(
                ctx,
                x as u32,
                row.y,
                PixelAccumulators {
                    color: &mut row.color[x],
                    normal: &mut row.normals[x],
                    albedo: &mut row.albedo[x],
                    sample_count: row.sample_counts.as_deref_mut().map(|c| &mut c[x]),
                    squared_luminance: row.squared_luminance.as_deref_mut().map(|s| &mut s[x]),
                },
                counters,
            );
        }
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{
        camera::Camera,
        render_system::{
            device::AccelBuildFlags,
            scene::{Scene, SceneBuilder},
            settings::{RenderSettings, WorldSettings},
        },
    };

    /// A host-resident scene for driving the kernel directly.
    pub struct TestScene {
        pub scene: Scene,
        pub bvh: Bvh,
        pub has_vertex_normals: Vec<u32>,
        pub textures: Vec<Arc<TextureImage>>,
        pub camera: DeviceCamera,
        pub params: KernelParameters,
    }

    impl TestScene {
        pub fn new(meshes: Vec<(Vec<Point3<f32>>, Vec<u32>, Material)>) -> TestScene {
            let mut builder = SceneBuilder::new();
            for (i, (positions, indices, material)) in meshes.into_iter().enumerate() {
                let material = builder.add_material(format!("m{i}"), material);
                builder.add_mesh(&positions, &indices, None, None, material);
            }
            let scene = builder.build();
            let triangles = (0..scene.triangle_count())
                .map(|t| {
                    [0, 1, 2].map(|k| {
                        Point3::from(scene.vertex_positions[scene.triangle_indices[t * 3 + k] as usize])
                    })
                })
                .collect();
            let bvh = Bvh::build(triangles, AccelBuildFlags::PreferFastTrace);
            let has_vertex_normals = scene.has_vertex_normals.iter().map(|&b| b as u32).collect();
            let camera = Camera::look_at(
                Point3::new(0.0, 1.0, 3.0),
                Point3::new(0.0, 1.0, 0.0),
                Vector3::y(),
                0.7,
            )
            .to_device();
            let params = KernelParameters::new(
                &RenderSettings::default(),
                &WorldSettings::default(),
                [1, 1],
                false,
            );
            TestScene {
                scene,
                bvh,
                has_vertex_normals,
                textures: vec![],
                camera,
                params,
            }
        }

        pub fn with_context<R>(
            &self,
            config: &KernelConfig,
            f: impl FnOnce(&KernelContext) -> R,
        ) -> R {
            let scene = SceneData {
                triangle_indices: &self.scene.triangle_indices,
                vertex_positions: &self.scene.vertex_positions,
                has_vertex_normals: &self.has_vertex_normals,
                vertex_normals: &self.scene.vertex_normals,
                texcoords: &self.scene.texcoords,
                material_indices: &self.scene.material_indices,
                materials: &self.scene.materials,
                emissive_triangle_indices: &self.scene.emissive_triangle_indices,
                textures: &self.textures,
                accel: &self.bvh,
            };
            let ctx = KernelContext::new(config, scene, None, &self.camera, &self.params);
            f(&ctx)
        }
    }

    impl KernelContext<'_> {
        pub fn test_surface(
            &self,
            position: Point3<f32>,
            normal: Vector3<f32>,
            material: usize,
        ) -> SurfaceHit {
            SurfaceHit {
                position,
                geometric_normal: normal,
                shading_normal: normal,
                material: self.surface_material(&self.scene.materials[material], None),
                triangle: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::TestScene, *};
    use crate::render_system::settings::{AmbientLightType, RenderSettings, WorldSettings};
    use crate::utils::quad;

    struct Pixel {
        color: [f32; 3],
        normal: [f32; 3],
        albedo: [f32; 3],
        count: u32,
        sq: f32,
    }

    impl Pixel {
        fn new() -> Pixel {
            Pixel {
                color: [0.0; 3],
                normal: [0.0; 3],
                albedo: [0.0; 3],
                count: 0,
                sq: 0.0,
            }
        }

        fn render(&mut self, ctx: &KernelContext, adaptive: bool) -> StatusCounters {
            let counters = StatusCounters::default();
            render_pixel(
                ctx,
                0,
                0,
                PixelAccumulators {
                    color: &mut self.color,
                    normal: &mut self.normal,
                    albedo: &mut self.albedo,
                    sample_count: adaptive.then_some(&mut self.count),
                    squared_luminance: adaptive.then_some(&mut self.sq),
                },
                &counters,
            );
            counters
        }
    }

    fn empty_scene(render: &RenderSettings, ambient: [f32; 3]) -> TestScene {
        let mut test_scene = TestScene::new(vec![]);
        let world = WorldSettings {
            ambient_light_type: AmbientLightType::Uniform,
            uniform_light_color: ambient,
            ..Default::default()
        };
        test_scene.params = KernelParameters::new(render, &world, [1, 1], true);
        test_scene
    }

    #[test]
    fn first_frame_resets_accumulators() {
        let render = RenderSettings {
            samples_per_frame: 2,
            ..Default::default()
        };
        let test_scene = empty_scene(&render, [0.0; 3]);
        let mut pixel = Pixel::new();
        pixel.color = [9.0; 3];
        pixel.count = 77;
        pixel.sq = 3.0;
        test_scene.with_context(&KernelConfig::default(), |ctx| {
            pixel.render(ctx, true);
        });
        assert_eq!(pixel.color, [0.0; 3]);
        assert_eq!(pixel.count, 2);
        assert_eq!(pixel.sq, 0.0);
    }

    #[test]
    fn samples_accumulate_across_frames() {
        let render = RenderSettings {
            samples_per_frame: 4,
            ..Default::default()
        };
        let mut test_scene = empty_scene(&render, [0.25, 0.5, 1.0]);
        let mut pixel = Pixel::new();
        let config = KernelConfig::default();

        let counters = test_scene.with_context(&config, |ctx| pixel.render(ctx, false));
        assert_eq!(pixel.color, [1.0, 2.0, 4.0]);
        assert_eq!(counters.still_one_ray_active.load(Ordering::Relaxed), 1);

        test_scene.params.sample_number = 4;
        test_scene.params.frame_number = 1;
        test_scene.with_context(&config, |ctx| pixel.render(ctx, false));
        assert_eq!(pixel.color, [2.0, 4.0, 8.0]);
    }

    #[test]
    fn converged_pixel_is_rescaled_instead_of_sampled() {
        let render = RenderSettings {
            samples_per_frame: 2,
            enable_adaptive_sampling: true,
            adaptive_sampling_min_samples: 4,
            adaptive_sampling_noise_threshold: 0.01,
            ..Default::default()
        };
        let mut test_scene = empty_scene(&render, [0.5; 3]);
        test_scene.params.sample_number = 8;

        // eight identical samples of luminance 0.5: zero variance
        let mut pixel = Pixel::new();
        pixel.color = [4.0; 3];
        pixel.count = 8;
        pixel.sq = 8.0 * 0.25;

        let counters = test_scene.with_context(&KernelConfig::default(), |ctx| {
            pixel.render(ctx, true)
        });
        assert_eq!(counters.pixel_converged_count.load(Ordering::Relaxed), 1);
        assert_eq!(counters.still_one_ray_active.load(Ordering::Relaxed), 0);
        assert_eq!(pixel.count, 8);
        // mean over the next global sample number is unchanged
        assert!((pixel.color[0] / 10.0 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn invalid_samples_are_counted_and_flagged() {
        let backgrounds = [[f32::NAN, 0.0, 0.0], [-1.0, 0.0, 0.0], [0.0, f32::INFINITY, 0.0]];
        for (background, display_nans) in backgrounds
            .into_iter()
            .flat_map(|b| [(b, false), (b, true)])
        {
            let render = RenderSettings {
                display_nans,
                ..Default::default()
            };
            let test_scene = empty_scene(&render, background);
            let mut pixel = Pixel::new();
            let counters = test_scene.with_context(&KernelConfig::default(), |ctx| {
                pixel.render(ctx, false)
            });
            assert_eq!(counters.invalid_sample_count.load(Ordering::Relaxed), 1);
            assert_eq!(counters.still_one_ray_active.load(Ordering::Relaxed), 0);
            if display_nans {
                assert_eq!(pixel.color, NAN_DEBUG_COLOR);
            } else {
                assert_eq!(pixel.color, [0.0; 3]);
            }
        }
    }

    #[test]
    fn low_resolution_skips_pixels_off_the_grid() {
        let render = RenderSettings {
            render_low_resolution: true,
            low_resolution_scaling: 2,
            ..Default::default()
        };
        let mut test_scene = empty_scene(&render, [1.0; 3]);
        test_scene.params.width = 2;
        test_scene.params.height = 2;
        test_scene.with_context(&KernelConfig::default(), |ctx| {
            let counters = StatusCounters::default();
            let mut color = [[0.0; 3]; 4];
            let mut normals = [[0.0; 3]; 4];
            let mut albedo = [[0.0; 3]; 4];
            render_frame(
                ctx,
                FrameTargets {
                    color: &mut color,
                    normals: &mut normals,
                    albedo: &mut albedo,
                    sample_counts: None,
                    squared_luminance: None,
                },
                &counters,
            );
            assert_eq!(color[0], [1.0; 3]);
            assert_eq!(color[1], [0.0; 3]);
            assert_eq!(color[2], [0.0; 3]);
            assert_eq!(color[3], [0.0; 3]);
        });
    }

    #[test]
    fn frozen_random_repeats_every_frame() {
        // floor lit by a light only reachable through random bounces
        let (floor_p, floor_i) = quad(
            Point3::origin(),
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(5.0, 0.0, 0.0),
        );
        let (light_p, light_i) = quad(
            Point3::new(0.0, 2.0, 0.0),
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 0.5),
        );
        let mut test_scene = TestScene::new(vec![
            (floor_p, floor_i, Material::diffuse([0.8; 3])),
            (light_p, light_i, Material::emissive([5.0; 3])),
        ]);
        let render = RenderSettings {
            samples_per_frame: 8,
            freeze_random: true,
            ..Default::default()
        };
        let world = WorldSettings {
            ambient_light_type: AmbientLightType::None,
            ..Default::default()
        };
        test_scene.params = KernelParameters::new(&render, &world, [1, 1], false);
        let config = KernelConfig {
            light_sampling: LightSamplingStrategy::NoDirectLightSampling,
            ..Default::default()
        };

        let mut pixel = Pixel::new();
        test_scene.with_context(&config, |ctx| pixel.render(ctx, false));
        let first = pixel.color;

        test_scene.params.sample_number = 8;
        test_scene.params.frame_number = 1;
        test_scene.with_context(&config, |ctx| pixel.render(ctx, false));
        for c in 0..3 {
            assert!((pixel.color[c] - 2.0 * first[c]).abs() <= 1e-5 * first[c].max(1.0));
        }
    }

    #[test]
    fn brute_force_traversal_matches_accelerated() {
        let (floor_p, floor_i) = quad(
            Point3::origin(),
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(5.0, 0.0, 0.0),
        );
        let test_scene = TestScene::new(vec![(floor_p, floor_i, Material::diffuse([0.8; 3]))]);
        let ray = Ray {
            origin: Point3::new(0.3, 1.0, -0.2),
            direction: Vector3::new(0.1, -1.0, 0.2).normalize(),
        };
        let accelerated = test_scene.with_context(&KernelConfig::default(), |ctx| ctx.closest_hit(&ray));
        let brute_force = test_scene.with_context(
            &KernelConfig {
                use_hardware_acceleration: false,
                ..Default::default()
            },
            |ctx| ctx.closest_hit(&ray),
        );
        let (a, b) = (accelerated.unwrap(), brute_force.unwrap());
        assert!((a.t - b.t).abs() < 1e-5);
        assert_eq!(a.prim_idx, b.prim_idx);
    }

    #[test]
    fn config_rejects_unknown_macro_values() {
        let mut options = CompilerOptions::default();
        options.set_macro(DIRECT_LIGHT_SAMPLING_STRATEGY, 7);
        assert!(KernelConfig::from_options(&options).is_err());

        let mut options = CompilerOptions::default();
        options.set_macro(USE_HARDWARE_ACCELERATION, 0);
        options.set_macro(ENVMAP_SAMPLING_STRATEGY, 0);
        let config = KernelConfig::from_options(&options).unwrap();
        assert!(!config.use_hardware_acceleration);
        assert_eq!(config.envmap_sampling, EnvmapSamplingStrategy::NoSampling);
    }
}
