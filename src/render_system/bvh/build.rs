use nalgebra::{Point3, vector};
use tracing::debug;

use crate::render_system::{
    bvh::{BvhNode, aabb::Aabb},
    device::AccelBuildFlags,
};

#[derive(Clone, Debug)]
struct BuildBvhLeaf {
    first_prim_idx_idx: usize,
    prim_count: usize,
}

#[derive(Clone, Debug)]
struct BuildBvhInternalNode {
    left_child_idx: usize,
    right_child_idx: usize,
}

#[derive(Clone, Debug)]
enum BuildBvhNodeKind {
    Leaf(BuildBvhLeaf),
    InternalNode(BuildBvhInternalNode),
}

#[derive(Clone, Debug)]
struct BuildBvhNode {
    aabb: Aabb,
    kind: BuildBvhNodeKind,
}

#[derive(Clone, Copy, Debug)]
enum SplitMethod {
    // binned surface area heuristic
    BinnedSah,
    // split the largest centroid axis in half
    Midpoint,
}

impl From<AccelBuildFlags> for SplitMethod {
    fn from(flags: AccelBuildFlags) -> SplitMethod {
        match flags {
            AccelBuildFlags::PreferFastBuild => SplitMethod::Midpoint,
            AccelBuildFlags::PreferFastTrace => SplitMethod::BinnedSah,
        }
    }
}

struct BuildContext<'a> {
    prim_aabbs: &'a [Aabb],
    prim_centroids: &'a [Point3<f32>],
    method: SplitMethod,
}

fn leaf_bounds(leaf: &BuildBvhLeaf, prim_idxs: &[usize], prim_aabbs: &[Aabb]) -> Aabb {
    prim_idxs[leaf.first_prim_idx_idx..(leaf.first_prim_idx_idx + leaf.prim_count)]
        .iter()
        .fold(Aabb::Empty, |bound, &prim_idx| {
            Aabb::union(&bound, &prim_aabbs[prim_idx])
        })
}

fn centroid_bounds(
    leaf: &BuildBvhLeaf,
    prim_idxs: &[usize],
    prim_centroids: &[Point3<f32>],
    dimension: usize,
) -> (f32, f32) {
    let mut bounds_min = f32::MAX;
    let mut bounds_max = f32::MIN;
    for &prim_idx in &prim_idxs[leaf.first_prim_idx_idx..(leaf.first_prim_idx_idx + leaf.prim_count)] {
        let centroid = &prim_centroids[prim_idx];
        bounds_min = bounds_min.min(centroid[dimension]);
        bounds_max = bounds_max.max(centroid[dimension]);
    }
    (bounds_min, bounds_max)
}

fn find_best_plane(leaf: &BuildBvhLeaf, prim_idxs: &[usize], ctx: &BuildContext) -> (usize, f32) {
    const BINS: usize = 32;

    let mut best_cost = f32::MAX;
    let mut best_dimension = 0;
    let mut best_split_pos = 0.0;

    for dimension in 0..3 {
        let (bounds_min, bounds_max) =
            centroid_bounds(leaf, prim_idxs, ctx.prim_centroids, dimension);
        if bounds_max <= bounds_min {
            continue;
        }

        // the bounding box of each bin
        let mut bin_bounds = [Aabb::Empty; BINS];
        // the number of primitives in each bin
        let mut bin_primcount = [0usize; BINS];

        let scale = BINS as f32 / (bounds_max - bounds_min);
        for &prim_idx in
            &prim_idxs[leaf.first_prim_idx_idx..(leaf.first_prim_idx_idx + leaf.prim_count)]
        {
            let bin_idx = usize::min(
                BINS - 1,
                ((ctx.prim_centroids[prim_idx][dimension] - bounds_min) * scale) as usize,
            );
            bin_primcount[bin_idx] += 1;
            bin_bounds[bin_idx] = Aabb::union(&bin_bounds[bin_idx], &ctx.prim_aabbs[prim_idx]);
        }

        // there are BINS - 1 possible splits
        // 1 plane between every two bins
        let mut plane_aabb_to_left = [Aabb::Empty; BINS - 1];
        let mut plane_aabb_to_right = [Aabb::Empty; BINS - 1];
        let mut plane_primcount_to_left = [0; BINS - 1];
        let mut plane_primcount_to_right = [0; BINS - 1];

        let mut aabb_to_left = Aabb::Empty;
        let mut aabb_to_right = Aabb::Empty;
        let mut primcount_to_left = 0;
        let mut primcount_to_right = 0;

        for plane in 0..(BINS - 1) {
            primcount_to_left += bin_primcount[plane];
            plane_primcount_to_left[plane] = primcount_to_left;
            aabb_to_left = Aabb::union(&aabb_to_left, &bin_bounds[plane]);
            plane_aabb_to_left[plane] = aabb_to_left;

            primcount_to_right += bin_primcount[BINS - 1 - plane];
            plane_primcount_to_right[BINS - 2 - plane] = primcount_to_right;
            aabb_to_right = Aabb::union(&aabb_to_right, &bin_bounds[BINS - 1 - plane]);
            plane_aabb_to_right[BINS - 2 - plane] = aabb_to_right;
        }

        let bin_width = (bounds_max - bounds_min) / BINS as f32;

        for plane in 0..(BINS - 1) {
            // surface area metric
            let cost = plane_aabb_to_left[plane].area() * plane_primcount_to_left[plane] as f32
                + plane_aabb_to_right[plane].area() * plane_primcount_to_right[plane] as f32;
            if cost < best_cost {
                best_cost = cost;
                best_dimension = dimension;
                best_split_pos = bounds_min + (plane as f32 + 1.0) * bin_width;
            }
        }
    }
    (best_dimension, best_split_pos)
}

fn find_midpoint_plane(leaf: &BuildBvhLeaf, prim_idxs: &[usize], ctx: &BuildContext) -> (usize, f32) {
    let (dimension, (lo, hi)) = (0..3)
        .map(|dimension| {
            (
                dimension,
                centroid_bounds(leaf, prim_idxs, ctx.prim_centroids, dimension),
            )
        })
        .max_by(|(_, (alo, ahi)), (_, (blo, bhi))| (ahi - alo).total_cmp(&(bhi - blo)))
        .unwrap_or((0, (0.0, 0.0)));
    (dimension, 0.5 * (lo + hi))
}

fn subdivide(
    node_idx: usize,
    prim_idxs: &mut [usize],
    nodes: &mut Vec<BuildBvhNode>,
    ctx: &BuildContext,
) {
    let BuildBvhNodeKind::Leaf(leaf) = nodes[node_idx].kind.clone() else {
        return;
    };
    if leaf.prim_count < 2 {
        return;
    }

    let left_count = if leaf.prim_count == 2 {
        1
    } else {
        // get best plane to split along
        let (dimension, split_pos) = match ctx.method {
            SplitMethod::BinnedSah => find_best_plane(&leaf, prim_idxs, ctx),
            SplitMethod::Midpoint => find_midpoint_plane(&leaf, prim_idxs, ctx),
        };

        // partition the primitives in place by modifying prim_idxs
        let (left, right) = partition::partition(
            &mut prim_idxs[leaf.first_prim_idx_idx..(leaf.first_prim_idx_idx + leaf.prim_count)],
            |&prim_idx| ctx.prim_centroids[prim_idx][dimension] < split_pos,
        );

        // if one of the subdivisions is empty then we fall back to splitting in half
        if left.is_empty() || right.is_empty() {
            debug!(prim_count = leaf.prim_count, "falling back to median partitioning");
            leaf.prim_count / 2
        } else {
            left.len()
        }
    };

    let left_leaf = BuildBvhLeaf {
        first_prim_idx_idx: leaf.first_prim_idx_idx,
        prim_count: left_count,
    };
    let right_leaf = BuildBvhLeaf {
        first_prim_idx_idx: leaf.first_prim_idx_idx + left_count,
        prim_count: leaf.prim_count - left_count,
    };

    let left_child_idx = insert_leaf_node(left_leaf, nodes, prim_idxs, ctx.prim_aabbs);
    let right_child_idx = insert_leaf_node(right_leaf, nodes, prim_idxs, ctx.prim_aabbs);

    subdivide(left_child_idx, prim_idxs, nodes, ctx);
    subdivide(right_child_idx, prim_idxs, nodes, ctx);

    nodes[node_idx].kind = BuildBvhNodeKind::InternalNode(BuildBvhInternalNode {
        left_child_idx,
        right_child_idx,
    });
}

fn insert_leaf_node(
    leaf: BuildBvhLeaf,
    nodes: &mut Vec<BuildBvhNode>,
    prim_idxs: &[usize],
    prim_aabbs: &[Aabb],
) -> usize {
    let node_idx = nodes.len();
    nodes.push(BuildBvhNode {
        aabb: leaf_bounds(&leaf, prim_idxs, prim_aabbs),
        kind: BuildBvhNodeKind::Leaf(leaf),
    });
    node_idx
}

/// Builds a one-triangle-per-leaf BVH. Node 0 is the root; children always come after their
/// parent.
pub fn build_triangle_bvh(triangles: &[[Point3<f32>; 3]], flags: AccelBuildFlags) -> Vec<BvhNode> {
    let n_prims = triangles.len();
    if n_prims == 0 {
        return vec![];
    }

    let mut prim_idxs = (0..n_prims).collect::<Vec<_>>();

    let prim_aabbs = triangles
        .iter()
        .map(|tri| Aabb::from_points(tri))
        .collect::<Vec<_>>();

    let prim_centroids = triangles
        .iter()
        .map(|[v0, v1, v2]| Point3::from((v0.coords + v1.coords + v2.coords) / 3.0))
        .collect::<Vec<_>>();

    let ctx = BuildContext {
        prim_aabbs: &prim_aabbs,
        prim_centroids: &prim_centroids,
        method: flags.into(),
    };

    let mut nodes = vec![];
    let root_node_idx = insert_leaf_node(
        BuildBvhLeaf {
            first_prim_idx_idx: 0,
            prim_count: n_prims,
        },
        &mut nodes,
        &prim_idxs,
        &prim_aabbs,
    );

    subdivide(root_node_idx, &mut prim_idxs, &mut nodes, &ctx);

    let padding = vector![0.0001, 0.0001, 0.0001];

    // flatten into the compact form the traversal reads
    nodes
        .into_iter()
        .map(|node| match node.kind {
            BuildBvhNodeKind::Leaf(ref leaf) => {
                let prim_idx = prim_idxs[leaf.first_prim_idx_idx];
                let aabb = &prim_aabbs[prim_idx];
                BvhNode {
                    left_node_idx: u32::MAX,
                    right_node_idx_or_prim_idx: prim_idx as u32,
                    min: (aabb.min().coords - padding).into(),
                    max: (aabb.max().coords + padding).into(),
                }
            }
            BuildBvhNodeKind::InternalNode(ref internal_node) => BvhNode {
                left_node_idx: internal_node.left_child_idx as u32,
                right_node_idx_or_prim_idx: internal_node.right_child_idx as u32,
                min: (node.aabb.min().coords - padding).into(),
                max: (node.aabb.max().coords + padding).into(),
            },
        })
        .collect()
}
