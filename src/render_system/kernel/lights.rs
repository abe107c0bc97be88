use nalgebra::Vector3;

use crate::render_system::{
    kernel::{
        KernelContext, SurfaceHit,
        bsdf,
        rng::Xorshift32,
        sampling::uniform_triangle_point,
    },
    settings::{AmbientLightType, EnvmapSamplingStrategy, LightSamplingStrategy},
};

/// Next event estimation towards one uniformly chosen emissive triangle.
pub fn sample_one_light(
    ctx: &KernelContext,
    surface: &SurfaceHit,
    wo: &Vector3<f32>,
    rng: &mut Xorshift32,
) -> Vector3<f32> {
    if ctx.config.light_sampling == LightSamplingStrategy::NoDirectLightSampling {
        return Vector3::zeros();
    }
    let lights = ctx.scene.emissive_triangle_indices;
    if lights.is_empty() {
        return Vector3::zeros();
    }

    let pick = ((rng.next_f32() * lights.len() as f32) as usize).min(lights.len() - 1);
    let light_triangle = lights[pick];
    let tri = ctx.scene.triangle(light_triangle);
    let u1 = rng.next_f32();
    let u2 = rng.next_f32();
    let point = uniform_triangle_point(&tri, u1, u2);

    let cross = (tri[1] - tri[0]).cross(&(tri[2] - tri[0]));
    let area = 0.5 * cross.norm();
    if area <= 0.0 {
        return Vector3::zeros();
    }
    let light_normal = cross / (2.0 * area);

    let to_light = point - surface.position;
    let dist_squared = to_light.norm_squared();
    if dist_squared <= 0.0 {
        return Vector3::zeros();
    }
    let dist = dist_squared.sqrt();
    let wi = to_light / dist;

    let cos_surface = wi.dot(&surface.shading_normal);
    let cos_light = light_normal.dot(&wi).abs();
    if cos_surface <= 0.0 || cos_light <= 1e-6 {
        return Vector3::zeros();
    }

    let f = bsdf::eval(&surface.material, wo, &wi, &surface.shading_normal);
    if f == Vector3::zeros() {
        return Vector3::zeros();
    }
    if ctx.occluded(&surface.spawn_origin(&wi), &point) {
        return Vector3::zeros();
    }

    let emission = Vector3::from(ctx.scene.material_of(light_triangle).emission);
    // solid angle pdf of picking this point
    let pdf = dist_squared / (cos_light * area * lights.len() as f32);
    f.component_mul(&emission) * (cos_surface / pdf)
}

/// Next event estimation towards the environment map through its luminance CDF.
pub fn sample_environment_map(
    ctx: &KernelContext,
    surface: &SurfaceHit,
    wo: &Vector3<f32>,
    rng: &mut Xorshift32,
) -> Vector3<f32> {
    if !ctx.samples_environment() {
        return Vector3::zeros();
    }
    let Some(environment) = &ctx.environment else {
        return Vector3::zeros();
    };
    let Some((wi, pdf)) = environment.sample(rng) else {
        return Vector3::zeros();
    };

    let cos_surface = wi.dot(&surface.shading_normal);
    if cos_surface <= 0.0 || pdf <= 0.0 {
        return Vector3::zeros();
    }
    let f = bsdf::eval(&surface.material, wo, &wi, &surface.shading_normal);
    if f == Vector3::zeros() || ctx.occluded_direction(&surface.spawn_origin(&wi), &wi) {
        return Vector3::zeros();
    }

    let radiance = environment.lookup(&wi) * ctx.params.envmap_intensity;
    f.component_mul(&radiance) * (cos_surface / pdf)
}

impl KernelContext<'_> {
    pub(crate) fn samples_environment(&self) -> bool {
        self.config.envmap_sampling == EnvmapSamplingStrategy::Cdf
            && self.params.ambient_light_type() == AmbientLightType::Envmap
            && self.environment.is_some()
    }

    pub(crate) fn samples_lights(&self) -> bool {
        self.config.light_sampling == LightSamplingStrategy::UniformOneLight
    }

    /// Radiance carried by a ray that left the scene.
    pub(crate) fn miss_radiance(&self, direction: &Vector3<f32>, bounce: u32) -> Vector3<f32> {
        match self.params.ambient_light_type() {
            AmbientLightType::None => Vector3::zeros(),
            AmbientLightType::Uniform => Vector3::from(self.params.uniform_light_color),
            AmbientLightType::Envmap => {
                let Some(environment) = &self.environment else {
                    return Vector3::zeros();
                };
                // already accounted for by environment sampling
                if bounce > 0 && self.samples_environment() {
                    return Vector3::zeros();
                }
                let scale = if bounce == 0 && self.params.envmap_scale_background_intensity == 0 {
                    1.0
                } else {
                    self.params.envmap_intensity
                };
                environment.lookup(direction) * scale
            }
        }
    }
}
