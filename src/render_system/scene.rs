use std::{path::PathBuf, sync::Arc};

use bytemuck::{Pod, Zeroable};
use image::{Rgba32FImage, RgbaImage};
use nalgebra::{Point3, Vector4};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;
use tracing::{debug, info};

use crate::{
    camera::Camera,
    error::{RenderError, Result},
    render_system::device::srgb_to_linear,
};

/// Sentinel for "no texture" in material texture slots.
pub const NO_TEXTURE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
#[serde(default)]
pub struct Material {
    pub base_color: [f32; 3],
    pub roughness: f32,
    pub emission: [f32; 3],
    pub metallic: f32,
    // weight of the dielectric specular lobe
    pub specular: f32,
    pub specular_transmission: f32,
    pub ior: f32,
    pub base_color_texture: i32,
    // glTF convention: roughness in G, metallic in B
    pub roughness_metallic_texture: i32,
}

impl Default for Material {
    fn default() -> Material {
        Material {
            base_color: [0.8, 0.8, 0.8],
            roughness: 0.5,
            emission: [0.0; 3],
            metallic: 0.0,
            specular: 0.5,
            specular_transmission: 0.0,
            ior: 1.45,
            base_color_texture: NO_TEXTURE,
            roughness_metallic_texture: NO_TEXTURE,
        }
    }
}

impl Material {
    pub fn diffuse(base_color: [f32; 3]) -> Material {
        Material {
            base_color,
            roughness: 1.0,
            specular: 0.0,
            ..Default::default()
        }
    }

    pub fn emissive(emission: [f32; 3]) -> Material {
        Material {
            base_color: [0.0; 3],
            emission,
            specular: 0.0,
            ..Default::default()
        }
    }

    pub fn is_emissive(&self) -> bool {
        self.emission.iter().any(|&e| e > 0.0)
    }
}

/// A decoded texture. LDR textures carry their colorspace; HDR textures are linear.
#[derive(Clone, Debug)]
pub enum TextureImage {
    Ldr { image: RgbaImage, is_srgb: bool },
    Hdr(Rgba32FImage),
}

impl TextureImage {
    pub fn width(&self) -> u32 {
        match self {
            TextureImage::Ldr { image, .. } => image.width(),
            TextureImage::Hdr(image) => image.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            TextureImage::Ldr { image, .. } => image.height(),
            TextureImage::Hdr(image) => image.height(),
        }
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, TextureImage::Ldr { is_srgb: true, .. })
    }

    /// Linear RGBA value of a texel; coordinates wrap.
    pub fn fetch(&self, x: i64, y: i64) -> Vector4<f32> {
        let x = x.rem_euclid(self.width() as i64) as u32;
        let y = y.rem_euclid(self.height() as i64) as u32;
        match self {
            TextureImage::Ldr { image, is_srgb } => {
                let [r, g, b, a] = image.get_pixel(x, y).0;
                let decode = |v: u8| {
                    let v = v as f32 / 255.0;
                    if *is_srgb { srgb_to_linear(v) } else { v }
                };
                Vector4::new(decode(r), decode(g), decode(b), a as f32 / 255.0)
            }
            TextureImage::Hdr(image) => Vector4::from(image.get_pixel(x, y).0),
        }
    }

    /// Nearest-texel lookup at normalized coordinates (v = 0 is the top row).
    pub fn sample(&self, uv: [f32; 2]) -> Vector4<f32> {
        let x = (uv[0] * self.width() as f32).floor() as i64;
        let y = (uv[1] * self.height() as f32).floor() as i64;
        self.fetch(x, y)
    }
}

#[derive(Clone, Debug)]
pub struct TextureRequest {
    pub path: PathBuf,
    pub is_srgb: bool,
}

type TextureSlots = Arc<Mutex<Vec<Option<Result<TextureImage>>>>>;

/// Textures being decoded on a worker pool. Joined by the scene uploader before the textures
/// are copied to the device.
pub struct TextureLoadHandle {
    pool: ThreadPool,
    slots: TextureSlots,
}

impl TextureLoadHandle {
    pub fn spawn(requests: Vec<TextureRequest>, num_threads: usize) -> TextureLoadHandle {
        let pool = ThreadPool::with_name("texture-decode".to_owned(), num_threads.max(1));
        let slots: TextureSlots = Arc::new(Mutex::new((0..requests.len()).map(|_| None).collect()));

        for (idx, request) in requests.into_iter().enumerate() {
            let slots = slots.clone();
            pool.execute(move || {
                let decoded = image::open(&request.path)
                    .map(|image| TextureImage::Ldr {
                        image: image.into_rgba8(),
                        is_srgb: request.is_srgb,
                    })
                    .map_err(|source| RenderError::TextureDecode {
                        path: request.path.clone(),
                        source,
                    });
                debug!(path = %request.path.display(), ok = decoded.is_ok(), "decoded texture");
                slots.lock()[idx] = Some(decoded);
            });
        }

        TextureLoadHandle { pool, slots }
    }

    pub fn join(self) -> Result<Vec<TextureImage>> {
        self.pool.join();
        if self.pool.panic_count() > 0 {
            return Err(RenderError::TextureLoaderPanicked);
        }
        let mut slots = self.slots.lock();
        slots
            .drain(..)
            .map(|slot| slot.unwrap_or(Err(RenderError::TextureLoaderPanicked)))
            .collect()
    }
}

pub enum SceneTextures {
    Ready(Vec<TextureImage>),
    Loading(TextureLoadHandle),
}

impl Default for SceneTextures {
    fn default() -> SceneTextures {
        SceneTextures::Ready(vec![])
    }
}

impl SceneTextures {
    /// Blocks until the textures are decoded.
    pub fn wait(&mut self) -> Result<&[TextureImage]> {
        if let SceneTextures::Loading(_) = self {
            let SceneTextures::Loading(handle) = std::mem::take(self) else {
                unreachable!()
            };
            let textures = handle.join()?;
            info!(count = textures.len(), "texture decoding finished");
            *self = SceneTextures::Ready(textures);
        }
        match self {
            SceneTextures::Ready(textures) => Ok(textures),
            SceneTextures::Loading(_) => unreachable!(),
        }
    }
}

/// Normalized in-memory scene as delivered by an importer.
#[derive(Default)]
pub struct Scene {
    pub materials: Vec<Material>,
    pub material_names: Vec<String>,
    // three indices per triangle
    pub triangle_indices: Vec<u32>,
    pub vertex_positions: Vec<[f32; 3]>,
    // per vertex; normals are only read where this is set
    pub has_vertex_normals: Vec<bool>,
    pub vertex_normals: Vec<[f32; 3]>,
    // per vertex, or empty when the scene is untextured
    pub texcoords: Vec<[f32; 2]>,
    // per triangle
    pub material_indices: Vec<u32>,
    pub emissive_triangle_indices: Vec<u32>,
    pub textures: SceneTextures,
    pub camera: Option<Camera>,
}

impl Scene {
    pub fn triangle_count(&self) -> usize {
        self.triangle_indices.len() / 3
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RenderError::InvalidScene(msg));
        let n_vertices = self.vertex_positions.len();

        if self.triangle_indices.len() % 3 != 0 {
            return fail(format!(
                "index count {} is not a multiple of 3",
                self.triangle_indices.len()
            ));
        }
        if let Some(&idx) = self
            .triangle_indices
            .iter()
            .find(|&&idx| idx as usize >= n_vertices)
        {
            return fail(format!("vertex index {idx} out of range ({n_vertices} vertices)"));
        }
        if self.has_vertex_normals.len() != n_vertices || self.vertex_normals.len() != n_vertices {
            return fail(format!(
                "expected {n_vertices} normals and normal flags, got {} and {}",
                self.vertex_normals.len(),
                self.has_vertex_normals.len()
            ));
        }
        if !self.texcoords.is_empty() && self.texcoords.len() != n_vertices {
            return fail(format!(
                "expected {n_vertices} texcoords, got {}",
                self.texcoords.len()
            ));
        }
        if self.material_indices.len() != self.triangle_count() {
            return fail(format!(
                "expected {} material indices, got {}",
                self.triangle_count(),
                self.material_indices.len()
            ));
        }
        if let Some(&idx) = self
            .material_indices
            .iter()
            .find(|&&idx| idx as usize >= self.materials.len())
        {
            return fail(format!("material index {idx} out of range"));
        }
        if let Some(&idx) = self
            .emissive_triangle_indices
            .iter()
            .find(|&&idx| idx as usize >= self.triangle_count())
        {
            return fail(format!("emissive triangle {idx} out of range"));
        }
        Ok(())
    }

    /// Indices of every triangle whose material emits light.
    pub fn collect_emissive_triangles(&self) -> Vec<u32> {
        self.material_indices
            .iter()
            .enumerate()
            .filter(|&(_, &material)| self.materials[material as usize].is_emissive())
            .map(|(triangle, _)| triangle as u32)
            .collect()
    }
}

/// Incrementally assembles a [`Scene`] out of meshes.
#[derive(Default)]
pub struct SceneBuilder {
    scene: Scene,
}

impl SceneBuilder {
    pub fn new() -> SceneBuilder {
        SceneBuilder::default()
    }

    pub fn add_material(&mut self, name: impl Into<String>, material: Material) -> u32 {
        self.scene.materials.push(material);
        self.scene.material_names.push(name.into());
        (self.scene.materials.len() - 1) as u32
    }

    pub fn add_texture(&mut self, texture: TextureImage) -> i32 {
        match &mut self.scene.textures {
            SceneTextures::Ready(textures) => {
                textures.push(texture);
                (textures.len() - 1) as i32
            }
            SceneTextures::Loading(_) => NO_TEXTURE,
        }
    }

    pub fn set_texture_loader(&mut self, handle: TextureLoadHandle) {
        self.scene.textures = SceneTextures::Loading(handle);
    }

    /// Adds an indexed triangle mesh. Indices are relative to `positions`.
    pub fn add_mesh(
        &mut self,
        positions: &[Point3<f32>],
        indices: &[u32],
        normals: Option<&[[f32; 3]]>,
        texcoords: Option<&[[f32; 2]]>,
        material: u32,
    ) {
        let base = self.scene.vertex_positions.len() as u32;
        let had_texcoords = !self.scene.texcoords.is_empty();

        self.scene
            .vertex_positions
            .extend(positions.iter().map(|p| [p.x, p.y, p.z]));
        match normals {
            Some(normals) => {
                self.scene.vertex_normals.extend_from_slice(normals);
                self.scene
                    .has_vertex_normals
                    .extend(std::iter::repeat_n(true, normals.len()));
            }
            None => {
                self.scene
                    .vertex_normals
                    .extend(std::iter::repeat_n([0.0; 3], positions.len()));
                self.scene
                    .has_vertex_normals
                    .extend(std::iter::repeat_n(false, positions.len()));
            }
        }
        match texcoords {
            Some(texcoords) => {
                if !had_texcoords {
                    // earlier meshes get zero texcoords
                    self.scene
                        .texcoords
                        .resize(base as usize, [0.0; 2]);
                }
                self.scene.texcoords.extend_from_slice(texcoords);
            }
            None if had_texcoords => self
                .scene
                .texcoords
                .extend(std::iter::repeat_n([0.0; 2], positions.len())),
            None => {}
        }

        self.scene
            .triangle_indices
            .extend(indices.iter().map(|i| i + base));
        self.scene
            .material_indices
            .extend(std::iter::repeat_n(material, indices.len() / 3));
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.scene.camera = Some(camera);
    }

    pub fn build(mut self) -> Scene {
        self.scene.emissive_triangle_indices = self.scene.collect_emissive_triangles();
        self.scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;
    use nalgebra::Vector3;

    fn two_quads() -> Scene {
        let mut builder = SceneBuilder::new();
        let white = builder.add_material("white", Material::diffuse([0.8; 3]));
        let light = builder.add_material("light", Material::emissive([4.0; 3]));
        let (positions, indices) = utils::quad(
            Point3::origin(),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        );
        builder.add_mesh(&positions, &indices, None, None, white);
        let (positions, indices) = utils::quad(
            Point3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        builder.add_mesh(&positions, &indices, None, None, light);
        builder.build()
    }

    #[test]
    fn builder_offsets_indices_and_finds_emitters() {
        let scene = two_quads();
        scene.validate().unwrap();
        assert_eq!(scene.triangle_count(), 4);
        assert_eq!(scene.emissive_triangle_indices, vec![2, 3]);
        assert!(scene.triangle_indices[6..].iter().all(|&i| i >= 4));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut scene = two_quads();
        scene.triangle_indices[0] = 99;
        assert!(matches!(
            scene.validate(),
            Err(RenderError::InvalidScene(_))
        ));
    }

    #[test]
    fn srgb_textures_decode_to_linear() {
        let image = RgbaImage::from_pixel(2, 2, image::Rgba([188, 188, 188, 255]));
        let srgb = TextureImage::Ldr {
            image: image.clone(),
            is_srgb: true,
        };
        let linear = TextureImage::Ldr {
            image,
            is_srgb: false,
        };
        let a = srgb.sample([0.25, 0.75]);
        let b = linear.sample([0.25, 0.75]);
        assert!((a.x - 0.5).abs() < 0.01);
        assert!((b.x - 188.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn missing_texture_file_fails_the_join() {
        let dir = tempfile::tempdir().unwrap();
        let handle = TextureLoadHandle::spawn(
            vec![TextureRequest {
                path: dir.path().join("missing.png"),
                is_srgb: true,
            }],
            2,
        );
        assert!(matches!(
            handle.join(),
            Err(RenderError::TextureDecode { .. })
        ));
    }

    #[test]
    fn loader_decodes_on_worker_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        RgbaImage::from_pixel(4, 2, image::Rgba([255, 0, 0, 255]))
            .save(&path)
            .unwrap();

        let mut textures = SceneTextures::Loading(TextureLoadHandle::spawn(
            vec![TextureRequest {
                path,
                is_srgb: false,
            }],
            1,
        ));
        let ready = textures.wait().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].width(), 4);
        assert_eq!(ready[0].fetch(5, 0).x, 1.0);
    }
}
