use nalgebra::{Point2, Point3, Vector2, Vector3};

use crate::{
    camera::Camera,
    render_system::scene::{Material, Scene, SceneBuilder},
};

/// Rec. 709 luminance of a linear RGB color.
#[inline]
pub fn luminance(c: &Vector3<f32>) -> f32 {
    0.2126 * c.x + 0.7152 * c.y + 0.0722 * c.z
}

// a parallelogram centered at `center`, spanning +-u and +-v. The face normal is u x v.
pub fn quad(
    center: Point3<f32>,
    half_u: Vector3<f32>,
    half_v: Vector3<f32>,
) -> (Vec<Point3<f32>>, Vec<u32>) {
    let positions = vec![
        center - half_u - half_v,
        center + half_u - half_v,
        center + half_u + half_v,
        center - half_u + half_v,
    ];
    (positions, vec![0, 1, 2, 0, 2, 3])
}

// an axis aligned box with outward facing triangles
pub fn cuboid(loc: Point3<f32>, dims: Vector3<f32>) -> (Vec<Point3<f32>>, Vec<u32>) {
    let f = loc - 0.5 * dims;
    let corner = |x: f32, y: f32, z: f32| Point3::new(f.x + x * dims.x, f.y + y * dims.y, f.z + z * dims.z);

    let positions = vec![
        corner(0.0, 0.0, 0.0), // v000
        corner(1.0, 0.0, 0.0), // v100
        corner(0.0, 0.0, 1.0), // v001
        corner(1.0, 0.0, 1.0), // v101
        corner(0.0, 1.0, 0.0), // v010
        corner(1.0, 1.0, 0.0), // v110
        corner(0.0, 1.0, 1.0), // v011
        corner(1.0, 1.0, 1.0), // v111
    ];
    let (v000, v100, v001, v101, v010, v110, v011, v111) = (0, 1, 2, 3, 4, 5, 6, 7);

    let faces = [
        // left
        [v000, v001, v011, v010],
        // right
        [v100, v110, v111, v101],
        // lower
        [v000, v100, v101, v001],
        // upper
        [v010, v011, v111, v110],
        // back
        [v000, v010, v110, v100],
        // front
        [v001, v101, v111, v011],
    ];

    let indices = faces
        .iter()
        .flat_map(|&[a, b, c, d]| [a, b, c, a, c, d])
        .collect();

    (positions, indices)
}

/// Pointer movement between two window positions, normalized by the smaller window side.
pub fn normalized_pointer_delta(
    prev: Point2<f32>,
    curr: Point2<f32>,
    extent: [u32; 2],
) -> Vector2<f32> {
    let trackball_radius = extent[0].min(extent[1]).max(1) as f32;
    (curr - prev) / trackball_radius
}

/// The classic two-box Cornell scene with a ceiling area light, 2 units wide, centered on x=0.
pub fn cornell_box() -> Scene {
    let mut builder = SceneBuilder::new();

    let white = builder.add_material("white", Material::diffuse([0.73, 0.73, 0.73]));
    let red = builder.add_material("red", Material::diffuse([0.65, 0.05, 0.05]));
    let green = builder.add_material("green", Material::diffuse([0.12, 0.45, 0.15]));
    let light = builder.add_material("light", Material::emissive([17.0, 12.0, 4.0]));
    let metal = builder.add_material(
        "metal",
        Material {
            base_color: [0.9, 0.9, 0.9],
            metallic: 1.0,
            roughness: 0.2,
            ..Default::default()
        },
    );

    let x = Vector3::x();
    let y = Vector3::y();
    let z = Vector3::z();

    let walls = [
        // floor
        (Point3::new(0.0, 0.0, 0.0), z, x, white),
        // ceiling
        (Point3::new(0.0, 2.0, 0.0), x, z, white),
        // back
        (Point3::new(0.0, 1.0, -1.0), x, y, white),
        // left
        (Point3::new(-1.0, 1.0, 0.0), y, z, red),
        // right
        (Point3::new(1.0, 1.0, 0.0), z, y, green),
    ];
    for (center, u, v, material) in walls {
        let (positions, indices) = quad(center, u, v);
        builder.add_mesh(&positions, &indices, None, None, material);
    }

    let (positions, indices) = quad(Point3::new(0.0, 1.98, 0.0), 0.25 * x, 0.2 * z);
    builder.add_mesh(&positions, &indices, None, None, light);

    let (positions, indices) = cuboid(Point3::new(-0.35, 0.6, -0.3), Vector3::new(0.55, 1.2, 0.55));
    builder.add_mesh(&positions, &indices, None, None, metal);
    let (positions, indices) = cuboid(Point3::new(0.35, 0.3, 0.35), Vector3::new(0.55, 0.6, 0.55));
    builder.add_mesh(&positions, &indices, None, None, white);

    builder.set_camera(Camera::look_at(
        Point3::new(0.0, 1.0, 3.4),
        Point3::new(0.0, 1.0, 0.0),
        Vector3::y(),
        40.0_f32.to_radians(),
    ));

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_normal(positions: &[Point3<f32>], tri: &[u32]) -> Vector3<f32> {
        let a = positions[tri[0] as usize];
        let b = positions[tri[1] as usize];
        let c = positions[tri[2] as usize];
        (b - a).cross(&(c - a)).normalize()
    }

    #[test]
    fn quad_normal_is_u_cross_v() {
        let (positions, indices) = quad(Point3::origin(), Vector3::z(), Vector3::x());
        for tri in indices.chunks(3) {
            assert!((face_normal(&positions, tri) - Vector3::y()).norm() < 1e-6);
        }
    }

    #[test]
    fn cuboid_faces_point_outward() {
        let center = Point3::new(1.0, 2.0, 3.0);
        let (positions, indices) = cuboid(center, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(indices.len(), 36);
        for tri in indices.chunks(3) {
            let n = face_normal(&positions, tri);
            let centroid = (positions[tri[0] as usize].coords
                + positions[tri[1] as usize].coords
                + positions[tri[2] as usize].coords)
                / 3.0;
            assert!(n.dot(&(centroid - center.coords)) > 0.0);
        }
    }

    #[test]
    fn cornell_box_is_valid() {
        let scene = cornell_box();
        scene.validate().unwrap();
        assert_eq!(scene.emissive_triangle_indices.len(), 2);
        assert!(scene.camera.is_some());
    }
}
