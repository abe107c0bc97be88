use nalgebra::{Point3, Vector3};

use crate::render_system::bvh::Ray;

#[derive(Clone, Copy, Debug)]
pub enum Aabb {
    Empty,
    NonEmpty { min: Point3<f32>, max: Point3<f32> },
}

impl Aabb {
    pub fn from_points(points: &[Point3<f32>]) -> Aabb {
        match points.split_first() {
            None => Aabb::Empty,
            Some((first, rest)) => {
                let (min, max) = rest
                    .iter()
                    .fold((*first, *first), |(min, max), p| (min.inf(p), max.sup(p)));
                Aabb::NonEmpty { min, max }
            }
        }
    }

    pub fn union(a: &Aabb, b: &Aabb) -> Aabb {
        match (a, b) {
            (Aabb::Empty, _) => *b,
            (_, Aabb::Empty) => *a,
            (
                Aabb::NonEmpty {
                    min: amin,
                    max: amax,
                },
                Aabb::NonEmpty {
                    min: bmin,
                    max: bmax,
                },
            ) => Aabb::NonEmpty {
                min: amin.inf(bmin),
                max: amax.sup(bmax),
            },
        }
    }

    pub fn area(&self) -> f32 {
        match self {
            Aabb::Empty => 0.0,
            Aabb::NonEmpty { min, max } => {
                let diff = max - min;
                2.0 * (diff.x * diff.y + diff.x * diff.z + diff.y * diff.z)
            }
        }
    }

    pub fn min(&self) -> Point3<f32> {
        match self {
            Aabb::Empty => Point3::origin(),
            Aabb::NonEmpty { min, .. } => *min,
        }
    }

    pub fn max(&self) -> Point3<f32> {
        match self {
            Aabb::Empty => Point3::origin(),
            Aabb::NonEmpty { max, .. } => *max,
        }
    }
}

/// Slab test against raw bounds. Returns the entry distance when the box is hit in
/// `[t_min, t_max]`.
#[inline]
pub fn ray_box_entry(
    ray: &Ray,
    inv_direction: &Vector3<f32>,
    min: &[f32; 3],
    max: &[f32; 3],
    t_min: f32,
    t_max: f32,
) -> Option<f32> {
    let mut t0 = t_min;
    let mut t1 = t_max;
    for axis in 0..3 {
        let near = (min[axis] - ray.origin[axis]) * inv_direction[axis];
        let far = (max[axis] - ray.origin[axis]) * inv_direction[axis];
        let (near, far) = if near <= far { (near, far) } else { (far, near) };
        // NaN from 0 * inf compares false and leaves the interval untouched
        if near > t0 {
            t0 = near;
        }
        if far < t1 {
            t1 = far;
        }
        if t0 > t1 {
            return None;
        }
    }
    Some(t0)
}
