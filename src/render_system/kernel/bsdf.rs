use std::f32::consts::PI;

use nalgebra::Vector3;

use crate::render_system::kernel::{
    rng::Xorshift32,
    sampling::{
        cosine_sample_hemisphere, fresnel_dielectric, local_to_world, reflect, refract,
    },
};

/// Material with its textures already applied at the shading point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceMaterial {
    pub base_color: Vector3<f32>,
    pub emission: Vector3<f32>,
    pub roughness: f32,
    pub metallic: f32,
    pub specular: f32,
    pub specular_transmission: f32,
    pub ior: f32,
}

impl SurfaceMaterial {
    pub fn is_emissive(&self) -> bool {
        self.emission.iter().any(|&e| e > 0.0)
    }

    pub fn is_transmissive(&self) -> bool {
        self.specular_transmission > 0.0
    }

    fn alpha(&self) -> f32 {
        (self.roughness * self.roughness).max(1e-3)
    }

    // metals are all specular
    fn specular_weight(&self) -> f32 {
        self.specular + (1.0 - self.specular) * self.metallic
    }

    fn specular_probability(&self) -> f32 {
        (0.5 * (self.specular_weight() + self.metallic)).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BsdfSample {
    pub direction: Vector3<f32>,
    // bsdf value, already including the lobe weight
    pub value: Vector3<f32>,
    pub pdf: f32,
    pub transmission: bool,
}

fn fresnel_schlick(f0: &Vector3<f32>, v_dot_h: f32) -> Vector3<f32> {
    let m = (1.0 - v_dot_h).clamp(0.0, 1.0).powi(5);
    f0 + (Vector3::repeat(1.0) - f0) * m
}

fn ggx_distribution(n_dot_h: f32, alpha: f32) -> f32 {
    let a2 = alpha * alpha;
    let d = n_dot_h * n_dot_h * (a2 - 1.0) + 1.0;
    a2 / (PI * d * d)
}

fn smith_g1(n_dot_x: f32, alpha: f32) -> f32 {
    let a2 = alpha * alpha;
    2.0 * n_dot_x / (n_dot_x + (a2 + (1.0 - a2) * n_dot_x * n_dot_x).sqrt())
}

/// Lambert + GGX Cook-Torrance reflection. Returns (f, pdf) of the reflective lobes.
fn eval_reflection(
    material: &SurfaceMaterial,
    wo: &Vector3<f32>,
    wi: &Vector3<f32>,
    n: &Vector3<f32>,
) -> (Vector3<f32>, f32) {
    let n_dot_v = n.dot(wo);
    let n_dot_l = n.dot(wi);
    if n_dot_v <= 0.0 || n_dot_l <= 0.0 {
        return (Vector3::zeros(), 0.0);
    }

    let h = (wo + wi).normalize();
    let n_dot_h = n.dot(&h).max(0.0);
    let v_dot_h = wo.dot(&h).max(1e-6);

    let alpha = material.alpha();
    let specular_weight = material.specular_weight();
    let f0 = Vector3::repeat(0.04).lerp(&material.base_color, material.metallic);
    let fresnel = fresnel_schlick(&f0, v_dot_h);

    let k_d = (Vector3::repeat(1.0) - specular_weight * fresnel) * (1.0 - material.metallic);
    let diffuse = k_d.component_mul(&material.base_color) / PI;

    let d = ggx_distribution(n_dot_h, alpha);
    let g = smith_g1(n_dot_v, alpha) * smith_g1(n_dot_l, alpha);
    let specular = fresnel * (specular_weight * d * g / (4.0 * n_dot_v * n_dot_l));

    let p_spec = material.specular_probability();
    let pdf = (1.0 - p_spec) * n_dot_l / PI + p_spec * d * n_dot_h / (4.0 * v_dot_h);

    (diffuse + specular, pdf)
}

/// Non-delta part of the BSDF, used for light and environment sampling.
pub fn eval(
    material: &SurfaceMaterial,
    wo: &Vector3<f32>,
    wi: &Vector3<f32>,
    n: &Vector3<f32>,
) -> Vector3<f32> {
    let (f, _) = eval_reflection(material, wo, wi, n);
    f * (1.0 - material.specular_transmission)
}

/// Importance samples the next direction. `None` when the sampled pdf is not positive.
pub fn sample(
    material: &SurfaceMaterial,
    wo: &Vector3<f32>,
    n: &Vector3<f32>,
    rng: &mut Xorshift32,
) -> Option<BsdfSample> {
    let transmission = material.specular_transmission;
    if transmission > 0.0 && rng.next_f32() < transmission {
        return sample_dielectric(material, wo, n, rng);
    }

    let p_spec = material.specular_probability();
    let u1 = rng.next_f32();
    let u2 = rng.next_f32();
    let direction = if rng.next_f32() < p_spec {
        let alpha = material.alpha();
        let a2 = alpha * alpha;
        let cos_theta = ((1.0 - u1) / (u1 * (a2 - 1.0) + 1.0)).clamp(0.0, 1.0).sqrt();
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let phi = 2.0 * PI * u2;
        let h = local_to_world(
            &Vector3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta),
            n,
        );
        reflect(wo, &h)
    } else {
        local_to_world(&cosine_sample_hemisphere(u1, u2), n)
    };

    let (f, pdf) = eval_reflection(material, wo, &direction, n);
    let pdf = pdf * (1.0 - transmission);
    (pdf > 0.0).then(|| BsdfSample {
        direction,
        value: f * (1.0 - transmission),
        pdf,
        transmission: false,
    })
}

// smooth dielectric, `n` points to the outside of the object
fn sample_dielectric(
    material: &SurfaceMaterial,
    wo: &Vector3<f32>,
    n: &Vector3<f32>,
    rng: &mut Xorshift32,
) -> Option<BsdfSample> {
    let entering = wo.dot(n) > 0.0;
    let (n, eta) = if entering {
        (*n, 1.0 / material.ior)
    } else {
        (-n, material.ior)
    };
    let cos_i = wo.dot(&n);
    let fresnel = fresnel_dielectric(cos_i, eta);
    let weight = material.specular_transmission;

    if rng.next_f32() < fresnel {
        let direction = reflect(wo, &n);
        let cos = direction.dot(&n).abs().max(1e-6);
        Some(BsdfSample {
            direction,
            value: Vector3::repeat(weight * fresnel / cos),
            pdf: weight * fresnel,
            transmission: false,
        })
    } else {
        let direction = refract(wo, &n, eta)?;
        let cos = direction.dot(&n).abs().max(1e-6);
        let pdf = weight * (1.0 - fresnel);
        (pdf > 0.0).then(|| BsdfSample {
            direction,
            value: material.base_color * (pdf / cos),
            pdf,
            transmission: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lambert(albedo: f32) -> SurfaceMaterial {
        SurfaceMaterial {
            base_color: Vector3::repeat(albedo),
            emission: Vector3::zeros(),
            roughness: 1.0,
            metallic: 0.0,
            specular: 0.0,
            specular_transmission: 0.0,
            ior: 1.5,
        }
    }

    #[test]
    fn lambert_weight_is_albedo() {
        let material = lambert(0.6);
        let n = Vector3::z();
        let wo = Vector3::new(0.2, 0.1, 1.0).normalize();
        let mut rng = Xorshift32::new(11);
        for _ in 0..64 {
            let s = sample(&material, &wo, &n, &mut rng).unwrap();
            let weight = s.value * s.direction.dot(&n) / s.pdf;
            assert!((weight - Vector3::repeat(0.6)).norm() < 1e-4);
        }
    }

    #[test]
    fn reflectance_is_energy_bounded() {
        // estimate directional albedo of a rough metal
        let material = SurfaceMaterial {
            metallic: 1.0,
            roughness: 0.4,
            base_color: Vector3::repeat(1.0),
            ..lambert(1.0)
        };
        let n = Vector3::z();
        let wo = Vector3::new(0.5, 0.0, 1.0).normalize();
        let mut rng = Xorshift32::new(5);
        let n_samples = 20_000;
        let mut albedo = 0.0;
        for _ in 0..n_samples {
            if let Some(s) = sample(&material, &wo, &n, &mut rng) {
                albedo += (s.value.x * s.direction.dot(&n) / s.pdf) as f64;
            }
        }
        let albedo = albedo / n_samples as f64;
        assert!(albedo > 0.5 && albedo <= 1.02, "albedo {albedo}");
    }

    #[test]
    fn glass_conserves_throughput() {
        let material = SurfaceMaterial {
            specular_transmission: 1.0,
            ..lambert(1.0)
        };
        let n = Vector3::z();
        let wo = Vector3::new(0.3, 0.0, 1.0).normalize();
        let mut rng = Xorshift32::new(3);
        for _ in 0..64 {
            let s = sample(&material, &wo, &n, &mut rng).unwrap();
            let weight = s.value * s.direction.dot(&n).abs() / s.pdf;
            assert!((weight - Vector3::repeat(1.0)).norm() < 1e-3);
            if s.transmission {
                assert!(s.direction.z < 0.0);
            }
        }
    }

    #[test]
    fn below_horizon_evaluates_to_zero() {
        let material = lambert(0.5);
        let n = Vector3::z();
        let f = eval(
            &material,
            &Vector3::z(),
            &Vector3::new(0.0, 0.0, -1.0),
            &n,
        );
        assert_eq!(f, Vector3::zeros());
    }
}
