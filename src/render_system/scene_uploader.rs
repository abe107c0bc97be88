use std::{sync::Arc, time::Instant};

use tracing::{debug, info};

use crate::{
    error::{RenderError, Result},
    render_system::{
        device::{AccelBuildFlags, Backend, DeviceBuffer, DeviceError},
        scene::{Material, Scene},
    },
};

/// A scene resident on the device.
pub struct DeviceScene<B: Backend> {
    pub triangle_indices: B::Buffer<u32>,
    pub vertex_positions: B::Buffer<[f32; 3]>,
    pub has_vertex_normals: B::Buffer<u32>,
    pub vertex_normals: B::Buffer<[f32; 3]>,
    pub texcoords: B::Buffer<[f32; 2]>,
    pub material_indices: B::Buffer<u32>,
    pub materials: B::Buffer<Material>,
    pub emissive_triangle_indices: B::Buffer<u32>,
    pub textures: Vec<B::Texture>,
    pub accel: B::Accel,
    pub triangle_count: u32,
    pub emissive_triangle_count: u32,
    pub has_texcoords: bool,
    // host copies needed to rebuild the emitter list when materials change
    material_indices_host: Vec<u32>,
    emissive_triangles_host: Vec<u32>,
}

impl<B: Backend> DeviceScene<B> {
    pub fn bindings(&self) -> SceneBindings<B> {
        SceneBindings {
            triangle_indices: self.triangle_indices.binding(),
            vertex_positions: self.vertex_positions.binding(),
            has_vertex_normals: self.has_vertex_normals.binding(),
            vertex_normals: self.vertex_normals.binding(),
            texcoords: self.texcoords.binding(),
            material_indices: self.material_indices.binding(),
            materials: self.materials.binding(),
            emissive_triangle_indices: self.emissive_triangle_indices.binding(),
            textures: self.textures.clone(),
            accel: self.accel.clone(),
            triangle_count: self.triangle_count,
            emissive_triangle_count: self.emissive_triangle_count,
            has_texcoords: self.has_texcoords,
        }
    }
}

pub struct SceneBindings<B: Backend> {
    pub triangle_indices: B::Binding<u32>,
    pub vertex_positions: B::Binding<[f32; 3]>,
    pub has_vertex_normals: B::Binding<u32>,
    pub vertex_normals: B::Binding<[f32; 3]>,
    pub texcoords: B::Binding<[f32; 2]>,
    pub material_indices: B::Binding<u32>,
    pub materials: B::Binding<Material>,
    pub emissive_triangle_indices: B::Binding<u32>,
    pub textures: Vec<B::Texture>,
    pub accel: B::Accel,
    pub triangle_count: u32,
    pub emissive_triangle_count: u32,
    pub has_texcoords: bool,
}

/// Copies normalized scenes to a device and builds their acceleration structure.
pub struct SceneUploader<B: Backend> {
    device: Arc<B>,
    accel_flags: AccelBuildFlags,
}

impl<B: Backend> SceneUploader<B> {
    pub fn new(device: Arc<B>, accel_flags: AccelBuildFlags) -> SceneUploader<B> {
        SceneUploader {
            device,
            accel_flags,
        }
    }

    pub fn upload(&self, scene: &mut Scene) -> Result<DeviceScene<B>> {
        let start = Instant::now();
        scene.validate()?;

        let device = &*self.device;
        let textures = scene
            .textures
            .wait()?
            .iter()
            .map(|texture| device.upload_texture(texture))
            .collect::<std::result::Result<Vec<_>, DeviceError>>()?;

        let has_vertex_normals = scene
            .has_vertex_normals
            .iter()
            .map(|&b| b as u32)
            .collect::<Vec<_>>();

        let triangle_indices = device.upload(&scene.triangle_indices)?;
        let vertex_positions = device.upload(&scene.vertex_positions)?;
        let accel = device
            .build_acceleration_structure(&vertex_positions, &triangle_indices, self.accel_flags)
            .map_err(|e| match e {
                DeviceError::AccelerationStructure(message) => {
                    RenderError::AccelerationStructure(message)
                }
                other => other.into(),
            })?;

        let device_scene = DeviceScene {
            has_vertex_normals: device.upload(&has_vertex_normals)?,
            vertex_normals: device.upload(&scene.vertex_normals)?,
            texcoords: device.upload(&scene.texcoords)?,
            material_indices: device.upload(&scene.material_indices)?,
            materials: device.upload(&scene.materials)?,
            emissive_triangle_indices: device.upload(&scene.emissive_triangle_indices)?,
            triangle_count: scene.triangle_count() as u32,
            emissive_triangle_count: scene.emissive_triangle_indices.len() as u32,
            has_texcoords: !scene.texcoords.is_empty(),
            material_indices_host: scene.material_indices.clone(),
            emissive_triangles_host: scene.emissive_triangle_indices.clone(),
            textures,
            accel,
            triangle_indices,
            vertex_positions,
        };
        info!(
            triangles = device_scene.triangle_count,
            emissive_triangles = device_scene.emissive_triangle_count,
            materials = scene.materials.len(),
            textures = device_scene.textures.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "uploaded scene"
        );
        Ok(device_scene)
    }

    /// Rewrites the material table of an uploaded scene in place. The emitter list is rebuilt
    /// when emission changed; the caller guarantees no launch references the scene.
    pub fn update_materials(
        &self,
        device_scene: &mut DeviceScene<B>,
        materials: &[Material],
    ) -> Result<()> {
        device_scene.materials.write(materials)?;

        let emissive = device_scene
            .material_indices_host
            .iter()
            .enumerate()
            .filter(|&(_, &m)| materials[m as usize].is_emissive())
            .map(|(triangle, _)| triangle as u32)
            .collect::<Vec<_>>();
        if emissive != device_scene.emissive_triangles_host {
            device_scene.emissive_triangle_indices = self.device.upload(&emissive)?;
            device_scene.emissive_triangle_count = emissive.len() as u32;
            debug!(
                emissive_triangles = emissive.len(),
                "rebuilt emissive triangle list"
            );
            device_scene.emissive_triangles_host = emissive;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{render_system::device::host::HostDevice, utils};

    #[test]
    fn cornell_box_uploads() {
        let device = Arc::new(HostDevice::new());
        let uploader = SceneUploader::new(device, AccelBuildFlags::PreferFastTrace);
        let mut scene = utils::cornell_box();
        let uploaded = uploader.upload(&mut scene).unwrap();
        assert_eq!(uploaded.triangle_count as usize, scene.triangle_count());
        assert!(uploaded.emissive_triangle_count > 0);
        assert_eq!(uploaded.materials.len(), scene.materials.len());
        assert_eq!(uploaded.accel.triangle_count(), scene.triangle_count());
    }

    #[test]
    fn invalid_scene_is_rejected_before_upload() {
        let device = Arc::new(HostDevice::new());
        let uploader = SceneUploader::new(device.clone(), AccelBuildFlags::default());
        let mut scene = utils::cornell_box();
        scene.material_indices.pop();
        assert!(matches!(
            uploader.upload(&mut scene),
            Err(RenderError::InvalidScene(_))
        ));
        assert!(device.memory_events().is_empty());
    }

    #[test]
    fn material_table_is_rewritten() {
        let device = Arc::new(HostDevice::new());
        let uploader = SceneUploader::new(device, AccelBuildFlags::default());
        let mut scene = utils::cornell_box();
        let mut uploaded = uploader.upload(&mut scene).unwrap();
        let emitters = uploaded.emissive_triangle_count;
        let mut materials = scene.materials.clone();
        materials[0].roughness = 0.123;
        uploader.update_materials(&mut uploaded, &materials).unwrap();
        assert_eq!(uploaded.materials.read().unwrap()[0].roughness, 0.123);
        assert_eq!(uploaded.emissive_triangle_count, emitters);
        assert!(uploader.update_materials(&mut uploaded, &materials[1..]).is_err());

        // turning every material off removes all emitters
        let dark = vec![Material::diffuse([0.5; 3]); materials.len()];
        uploader.update_materials(&mut uploaded, &dark).unwrap();
        assert_eq!(uploaded.emissive_triangle_count, 0);
        assert!(uploaded.emissive_triangle_indices.read().unwrap().is_empty());
    }
}
