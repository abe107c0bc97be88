use std::f32::consts::PI;

use nalgebra::{Point3, Vector3};

/// Tangent and bitangent completing `n` to a right handed frame (Duff et al. 2017).
#[inline]
pub fn orthonormal_basis(n: &Vector3<f32>) -> (Vector3<f32>, Vector3<f32>) {
    let sign = 1.0_f32.copysign(n.z);
    let a = -1.0 / (sign + n.z);
    let b = n.x * n.y * a;
    (
        Vector3::new(1.0 + sign * n.x * n.x * a, sign * b, -sign * n.x),
        Vector3::new(b, sign + n.y * n.y * a, -n.y),
    )
}

#[inline]
pub fn local_to_world(local: &Vector3<f32>, n: &Vector3<f32>) -> Vector3<f32> {
    let (t, b) = orthonormal_basis(n);
    t * local.x + b * local.y + n * local.z
}

/// Cosine weighted direction around +Z; pdf is cos(theta) / pi.
#[inline]
pub fn cosine_sample_hemisphere(u1: f32, u2: f32) -> Vector3<f32> {
    let r = u1.sqrt();
    let phi = 2.0 * PI * u2;
    Vector3::new(r * phi.cos(), r * phi.sin(), (1.0 - u1).max(0.0).sqrt())
}

/// Uniformly distributed point on a triangle.
#[inline]
pub fn uniform_triangle_point(tri: &[Point3<f32>; 3], u1: f32, u2: f32) -> Point3<f32> {
    let su = u1.sqrt();
    let b0 = 1.0 - su;
    let b1 = su * (1.0 - u2);
    let b2 = su * u2;
    Point3::from(tri[0].coords * b0 + tri[1].coords * b1 + tri[2].coords * b2)
}

/// Mirror `wo` (pointing away from the surface) about `n`.
#[inline]
pub fn reflect(wo: &Vector3<f32>, n: &Vector3<f32>) -> Vector3<f32> {
    2.0 * wo.dot(n) * n - wo
}

/// Unpolarized Fresnel reflectance. `eta` is n_incident / n_transmitted; returns 1 on total
/// internal reflection.
pub fn fresnel_dielectric(cos_i: f32, eta: f32) -> f32 {
    let cos_i = cos_i.clamp(0.0, 1.0);
    let sin2_t = eta * eta * (1.0 - cos_i * cos_i);
    if sin2_t >= 1.0 {
        return 1.0;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    let rs = (eta * cos_i - cos_t) / (eta * cos_i + cos_t);
    let rp = (cos_i - eta * cos_t) / (cos_i + eta * cos_t);
    0.5 * (rs * rs + rp * rp)
}

/// Refracted direction for `wo` on the side `n` points to, or `None` on total internal
/// reflection.
pub fn refract(wo: &Vector3<f32>, n: &Vector3<f32>, eta: f32) -> Option<Vector3<f32>> {
    let cos_i = wo.dot(n);
    let sin2_t = eta * eta * (1.0 - cos_i * cos_i).max(0.0);
    if sin2_t >= 1.0 {
        return None;
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    Some((-eta * wo + (eta * cos_i - cos_t) * n).normalize())
}
