use bytemuck::{Pod, Zeroable};
use nalgebra::{Point3, Vector3};

use crate::render_system::device::AccelBuildFlags;

pub mod aabb;
pub mod build;

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct BvhNode {
    // if this is 0xFFFFFFFF, then this is a leaf node
    pub left_node_idx: u32,
    // if left_node_idx is 0xFFFFFFFF, this is the triangle index
    // otherwise, it is the index of the right node
    pub right_node_idx_or_prim_idx: u32,
    pub min: [f32; 3],
    pub max: [f32; 3],
}

#[derive(Clone, Copy, Debug)]
pub struct Ray {
    pub origin: Point3<f32>,
    pub direction: Vector3<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriangleHit {
    pub t: f32,
    pub prim_idx: u32,
    // barycentrics of v1 and v2
    pub u: f32,
    pub v: f32,
}

/// Moller-Trumbore, two sided.
#[inline]
pub fn intersect_triangle(
    ray: &Ray,
    tri: &[Point3<f32>; 3],
    t_min: f32,
    t_max: f32,
) -> Option<(f32, f32, f32)> {
    const EPSILON: f32 = 1e-9;

    let edge1 = tri[1] - tri[0];
    let edge2 = tri[2] - tri[0];
    let pvec = ray.direction.cross(&edge2);
    let det = edge1.dot(&pvec);
    if det.abs() < EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;

    let tvec = ray.origin - tri[0];
    let u = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let qvec = tvec.cross(&edge1);
    let v = ray.direction.dot(&qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = edge2.dot(&qvec) * inv_det;
    (t > t_min && t < t_max).then_some((t, u, v))
}

/// Software acceleration structure over a triangle soup.
pub struct Bvh {
    nodes: Vec<BvhNode>,
    triangles: Vec<[Point3<f32>; 3]>,
}

impl Bvh {
    pub fn build(triangles: Vec<[Point3<f32>; 3]>, flags: AccelBuildFlags) -> Bvh {
        let nodes = build::build_triangle_bvh(&triangles, flags);
        Bvh { nodes, triangles }
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Nearest intersection strictly inside `(t_min, t_max)`.
    pub fn closest_hit(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<TriangleHit> {
        let mut closest: Option<TriangleHit> = None;
        self.traverse(ray, t_min, t_max, |prim_idx, t_max| {
            match intersect_triangle(ray, &self.triangles[prim_idx as usize], t_min, t_max) {
                Some((t, u, v)) => {
                    closest = Some(TriangleHit { t, prim_idx, u, v });
                    Traversal::Shrink(t)
                }
                None => Traversal::Continue,
            }
        });
        closest
    }

    /// True if anything blocks the segment.
    pub fn any_hit(&self, ray: &Ray, t_min: f32, t_max: f32) -> bool {
        let mut hit = false;
        self.traverse(ray, t_min, t_max, |prim_idx, t_max| {
            if intersect_triangle(ray, &self.triangles[prim_idx as usize], t_min, t_max).is_some() {
                hit = true;
                Traversal::Stop
            } else {
                Traversal::Continue
            }
        });
        hit
    }

    fn traverse(
        &self,
        ray: &Ray,
        t_min: f32,
        mut t_max: f32,
        mut visit_leaf: impl FnMut(u32, f32) -> Traversal,
    ) {
        if self.nodes.is_empty() {
            return;
        }
        let inv_direction = ray.direction.map(|d| 1.0 / d);

        let mut stack: Vec<u32> = Vec::with_capacity(64);
        stack.push(0);
        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx as usize];
            if aabb::ray_box_entry(ray, &inv_direction, &node.min, &node.max, t_min, t_max)
                .is_none()
            {
                continue;
            }
            if node.left_node_idx == u32::MAX {
                match visit_leaf(node.right_node_idx_or_prim_idx, t_max) {
                    Traversal::Continue => {}
                    Traversal::Shrink(t) => t_max = t,
                    Traversal::Stop => return,
                }
            } else {
                stack.push(node.right_node_idx_or_prim_idx);
                stack.push(node.left_node_idx);
            }
        }
    }
}

enum Traversal {
    Continue,
    Shrink(f32),
    Stop,
}
