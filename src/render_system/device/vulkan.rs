//! Vulkan accelerator. The path tracing kernel is GLSL compiled at runtime by shaderc; when the
//! physical device exposes `VK_KHR_ray_query` the kernel traces against a TLAS/BLAS pair,
//! otherwise it falls back to its own triangle loop.

use std::{collections::VecDeque, marker::PhantomData, sync::Arc, time::Instant};

use tracing::{debug, info, warn};
use vulkano::{
    DeviceSize, Packed24_8, Version, VulkanLibrary,
    acceleration_structure::{
        AccelerationStructure, AccelerationStructureBuildGeometryInfo,
        AccelerationStructureBuildRangeInfo, AccelerationStructureBuildSizesInfo,
        AccelerationStructureBuildType, AccelerationStructureCreateInfo,
        AccelerationStructureGeometries, AccelerationStructureGeometryInstancesData,
        AccelerationStructureGeometryInstancesDataType, AccelerationStructureGeometryTrianglesData,
        AccelerationStructureInstance, AccelerationStructureType, BuildAccelerationStructureFlags,
        BuildAccelerationStructureMode, GeometryFlags,
    },
    buffer::{Buffer, BufferCreateInfo, BufferUsage, IndexBuffer, Subbuffer},
    command_buffer::{
        AutoCommandBufferBuilder, CommandBufferUsage, CopyBufferToImageInfo,
        PrimaryAutoCommandBuffer, PrimaryCommandBufferAbstract,
        allocator::StandardCommandBufferAllocator,
    },
    descriptor_set::{
        DescriptorSet, WriteDescriptorSet, allocator::StandardDescriptorSetAllocator,
        layout::DescriptorBindingFlags,
    },
    device::{
        Device, DeviceCreateInfo, DeviceExtensions, DeviceFeatures, Queue, QueueCreateInfo,
        QueueFlags, physical::PhysicalDeviceType,
    },
    format::Format,
    image::{
        Image, ImageCreateInfo, ImageType, ImageUsage,
        sampler::{Filter, Sampler, SamplerAddressMode, SamplerCreateInfo},
        view::ImageView,
    },
    instance::{Instance, InstanceCreateFlags, InstanceCreateInfo, InstanceExtensions},
    memory::allocator::{
        AllocationCreateInfo, MemoryAllocator, MemoryTypeFilter, StandardMemoryAllocator,
    },
    pipeline::{
        ComputePipeline, Pipeline, PipelineBindPoint, PipelineLayout,
        PipelineShaderStageCreateInfo, compute::ComputePipelineCreateInfo,
        layout::PipelineDescriptorSetLayoutCreateInfo,
    },
    shader::{ShaderModule, ShaderModuleCreateInfo},
    sync::{self, GpuFuture, future::FenceSignalFuture},
};

use crate::render_system::{
    device::{
        AccelBuildFlags, Backend, CompletionSignal, ComputeStream, DeviceBuffer, DeviceData,
        DeviceError, DeviceInfo, FrameCompletion, RenderView, ResolveParams, completion_pair,
    },
    kernel_compiler::{CompilerOptions, KernelSource},
    resolve_shader,
    scene::TextureImage,
};

// upper bound of the variable-count texture array at binding 21
const MAX_TEXTURES: u32 = 1024;
const WORKGROUP_SIZE: u32 = 8;

const ACCEL_BINDING: u32 = 19;
const ENVMAP_BINDING: u32 = 20;
const TEXTURES_BINDING: u32 = 21;

fn allocation_error(len: usize) -> impl FnOnce(String) -> DeviceError {
    move |message| DeviceError::Allocation { len, message }
}

fn transfer_error(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Transfer(e.to_string())
}

fn launch_error(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Launch(e.to_string())
}

fn accel_error(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::AccelerationStructure(e.to_string())
}

fn texture_error(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Texture(e.to_string())
}

struct VulkanShared {
    device: Arc<Device>,
    queue: Arc<Queue>,
    memory_allocator: Arc<StandardMemoryAllocator>,
    command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
    descriptor_set_allocator: Arc<StandardDescriptorSetAllocator>,
    sampler: Arc<Sampler>,
    supports_ray_query: bool,
    // bound in place of optional resources the current launch does not have
    dummy_buffer: Subbuffer<[u8]>,
    dummy_texture: Arc<ImageView>,
    resolve_pipeline: Arc<ComputePipeline>,
}

impl VulkanShared {
    fn buffer_usage(&self) -> BufferUsage {
        let mut usage =
            BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST;
        if self.supports_ray_query {
            usage |= BufferUsage::SHADER_DEVICE_ADDRESS
                | BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY;
        }
        usage
    }

    fn host_visible_bytes(&self, size: DeviceSize) -> Result<Subbuffer<[u8]>, String> {
        Buffer::new_slice::<u8>(
            self.memory_allocator.clone(),
            BufferCreateInfo {
                usage: self.buffer_usage(),
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                    | MemoryTypeFilter::HOST_RANDOM_ACCESS,
                ..Default::default()
            },
            size.max(4),
        )
        .map_err(|e| e.to_string())
    }

    fn command_builder(
        &self,
    ) -> Result<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>, DeviceError> {
        command_builder(&self.command_buffer_allocator, &self.queue)
    }

    fn submit_and_wait(
        &self,
        builder: AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    ) -> Result<(), DeviceError> {
        submit_and_wait(&self.queue, builder)
    }
}

fn command_builder(
    command_buffer_allocator: &Arc<StandardCommandBufferAllocator>,
    queue: &Arc<Queue>,
) -> Result<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>, DeviceError> {
    AutoCommandBufferBuilder::primary(
        command_buffer_allocator.clone(),
        queue.queue_family_index(),
        CommandBufferUsage::OneTimeSubmit,
    )
    .map_err(launch_error)
}

/// Submits and blocks until the queue has executed the commands.
fn submit_and_wait(
    queue: &Arc<Queue>,
    builder: AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
) -> Result<(), DeviceError> {
    builder
        .build()
        .map_err(launch_error)?
        .execute(queue.clone())
        .map_err(launch_error)?
        .then_signal_fence_and_flush()
        .map_err(launch_error)?
        .wait(None)
        .map_err(|_| DeviceError::StreamLost)
}

/// A GPU selected through vulkano.
#[derive(Clone)]
pub struct VulkanDevice {
    shared: Arc<VulkanShared>,
}

fn required_features() -> DeviceFeatures {
    DeviceFeatures {
        scalar_block_layout: true,
        runtime_descriptor_array: true,
        descriptor_binding_variable_descriptor_count: true,
        descriptor_binding_partially_bound: true,
        shader_sampled_image_array_non_uniform_indexing: true,
        ..DeviceFeatures::empty()
    }
}

fn ray_query_features() -> DeviceFeatures {
    DeviceFeatures {
        acceleration_structure: true,
        buffer_device_address: true,
        ray_query: true,
        ..DeviceFeatures::empty()
    }
}

fn ray_query_extensions() -> DeviceExtensions {
    DeviceExtensions {
        khr_acceleration_structure: true,
        khr_deferred_host_operations: true,
        khr_ray_query: true,
        ..DeviceExtensions::empty()
    }
}

impl VulkanDevice {
    /// Picks the most capable compute device, preferring discrete GPUs.
    pub fn new() -> Result<VulkanDevice, DeviceError> {
        let no_device = |e: String| DeviceError::NoSuitableDevice(e);
        let library = VulkanLibrary::new().map_err(|e| no_device(e.to_string()))?;
        let instance = Instance::new(
            library.clone(),
            InstanceCreateInfo {
                flags: InstanceCreateFlags::ENUMERATE_PORTABILITY,
                enabled_extensions: InstanceExtensions {
                    khr_portability_enumeration: library
                        .supported_extensions()
                        .khr_portability_enumeration,
                    ..InstanceExtensions::empty()
                },
                ..Default::default()
            },
        )
        .map_err(|e| no_device(e.to_string()))?;

        let (physical_device, queue_family_index) = instance
            .enumerate_physical_devices()
            .map_err(|e| no_device(e.to_string()))?
            .filter(|p| p.api_version() >= Version::V1_2)
            .filter(|p| p.supported_features().contains(&required_features()))
            .filter_map(|p| {
                let queue_family_index = p
                    .queue_family_properties()
                    .iter()
                    .position(|q| q.queue_flags.intersects(QueueFlags::COMPUTE))?;
                Some((p, queue_family_index as u32))
            })
            .min_by_key(|(p, _)| match p.properties().device_type {
                PhysicalDeviceType::DiscreteGpu => 0,
                PhysicalDeviceType::IntegratedGpu => 1,
                PhysicalDeviceType::VirtualGpu => 2,
                PhysicalDeviceType::Cpu => 3,
                PhysicalDeviceType::Other => 4,
                _ => 5,
            })
            .ok_or_else(|| no_device("no Vulkan 1.2 device with compute support".to_owned()))?;

        let supports_ray_query = physical_device
            .supported_extensions()
            .contains(&ray_query_extensions())
            && physical_device
                .supported_features()
                .contains(&ray_query_features());

        let (enabled_extensions, enabled_features) = if supports_ray_query {
            (
                ray_query_extensions(),
                required_features().union(&ray_query_features()),
            )
        } else {
            (DeviceExtensions::empty(), required_features())
        };

        let (device, mut queues) = Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions,
                enabled_features,
                queue_create_infos: vec![QueueCreateInfo {
                    queue_family_index,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .map_err(|e| no_device(e.to_string()))?;
        let queue = queues
            .next()
            .ok_or_else(|| no_device("device exposed no queue".to_owned()))?;

        info!(
            device = %device.physical_device().properties().device_name,
            device_type = ?device.physical_device().properties().device_type,
            ray_query = supports_ray_query,
            "selected Vulkan device"
        );

        let memory_allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
        let command_buffer_allocator = Arc::new(StandardCommandBufferAllocator::new(
            device.clone(),
            Default::default(),
        ));
        let descriptor_set_allocator = Arc::new(StandardDescriptorSetAllocator::new(
            device.clone(),
            Default::default(),
        ));
        let sampler = Sampler::new(
            device.clone(),
            SamplerCreateInfo {
                mag_filter: Filter::Nearest,
                min_filter: Filter::Nearest,
                address_mode: [SamplerAddressMode::Repeat; 3],
                ..Default::default()
            },
        )
        .map_err(|e| no_device(e.to_string()))?;

        let resolve_pipeline = create_resolve_pipeline(device.clone())?;

        let dummy_texture = upload_image(
            &memory_allocator,
            &command_buffer_allocator,
            &queue,
            &TextureImage::Hdr(image::Rgba32FImage::from_pixel(1, 1, image::Rgba([0.0; 4]))),
        )?;
        let dummy_buffer = Buffer::new_slice::<u8>(
            memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::STORAGE_BUFFER,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
                ..Default::default()
            },
            16,
        )
        .map_err(|e| allocation_error(16)(e.to_string()))?;

        Ok(VulkanDevice {
            shared: Arc::new(VulkanShared {
                device,
                queue,
                memory_allocator,
                command_buffer_allocator,
                descriptor_set_allocator,
                sampler,
                supports_ray_query,
                dummy_buffer,
                dummy_texture,
                resolve_pipeline,
            }),
        })
    }

    pub fn supports_ray_query(&self) -> bool {
        self.shared.supports_ray_query
    }
}

fn upload_image(
    memory_allocator: &Arc<StandardMemoryAllocator>,
    command_buffer_allocator: &Arc<StandardCommandBufferAllocator>,
    queue: &Arc<Queue>,
    texture: &TextureImage,
) -> Result<Arc<ImageView>, DeviceError> {
    let (format, texels): (Format, Vec<u8>) = match texture {
        TextureImage::Ldr { image, is_srgb } => (
            if *is_srgb {
                Format::R8G8B8A8_SRGB
            } else {
                Format::R8G8B8A8_UNORM
            },
            image.as_raw().clone(),
        ),
        TextureImage::Hdr(image) => (
            Format::R32G32B32A32_SFLOAT,
            bytemuck::cast_slice(image.as_raw()).to_vec(),
        ),
    };
    if texels.is_empty() {
        return Err(DeviceError::Texture("texture has no texels".to_owned()));
    }

    let upload_buffer = Buffer::from_iter(
        memory_allocator.clone(),
        BufferCreateInfo {
            usage: BufferUsage::TRANSFER_SRC,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_HOST
                | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
            ..Default::default()
        },
        texels,
    )
    .map_err(texture_error)?;

    let image = Image::new(
        memory_allocator.clone(),
        ImageCreateInfo {
            image_type: ImageType::Dim2d,
            format,
            extent: [texture.width(), texture.height(), 1],
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
            ..Default::default()
        },
        AllocationCreateInfo::default(),
    )
    .map_err(texture_error)?;

    let mut builder = command_builder(command_buffer_allocator, queue)?;
    builder
        .copy_buffer_to_image(CopyBufferToImageInfo::buffer_image(
            upload_buffer,
            image.clone(),
        ))
        .map_err(texture_error)?;
    submit_and_wait(queue, builder)?;

    ImageView::new_default(image).map_err(texture_error)
}

fn create_compute_pipeline(
    device: Arc<Device>,
    module: Arc<ShaderModule>,
    variable_textures: bool,
) -> Result<Arc<ComputePipeline>, DeviceError> {
    let invalid = |e: String| DeviceError::InvalidProgram(e);
    let cs = module
        .entry_point("main")
        .ok_or_else(|| invalid("program has no `main` entry point".to_owned()))?;
    let stage = PipelineShaderStageCreateInfo::new(cs);

    let layout = {
        let mut layout_create_info = PipelineDescriptorSetLayoutCreateInfo::from_stages([&stage]);
        if variable_textures {
            if let Some(binding) = layout_create_info
                .set_layouts
                .get_mut(0)
                .and_then(|set| set.bindings.get_mut(&TEXTURES_BINDING))
            {
                binding.binding_flags |= DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                    | DescriptorBindingFlags::PARTIALLY_BOUND;
                binding.descriptor_count = MAX_TEXTURES;
            }
        }
        PipelineLayout::new(
            device.clone(),
            layout_create_info
                .into_pipeline_layout_create_info(device.clone())
                .map_err(|e| invalid(e.to_string()))?,
        )
        .map_err(|e| invalid(e.to_string()))?
    };

    ComputePipeline::new(
        device,
        None,
        ComputePipelineCreateInfo::stage_layout(stage, layout),
    )
    .map_err(|e| invalid(e.to_string()))
}

fn create_resolve_pipeline(device: Arc<Device>) -> Result<Arc<ComputePipeline>, DeviceError> {
    let module = resolve_shader::load(device.clone())
        .map_err(|e| DeviceError::InvalidProgram(e.to_string()))?;
    create_compute_pipeline(device, module, false)
}

/// Storage buffer in host-visible device memory, typed on the Rust side only.
pub struct VulkanBuffer<T: DeviceData> {
    bytes: Subbuffer<[u8]>,
    len: usize,
    _marker: PhantomData<T>,
}

pub struct VulkanBinding<T> {
    bytes: Subbuffer<[u8]>,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for VulkanBinding<T> {
    fn clone(&self) -> Self {
        VulkanBinding {
            bytes: self.bytes.clone(),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T> VulkanBinding<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: DeviceData> DeviceBuffer<T> for VulkanBuffer<T> {
    type Binding = VulkanBinding<T>;

    fn len(&self) -> usize {
        self.len
    }

    fn binding(&self) -> VulkanBinding<T> {
        VulkanBinding {
            bytes: self.bytes.clone(),
            len: self.len,
            _marker: PhantomData,
        }
    }

    fn write(&self, data: &[T]) -> Result<(), DeviceError> {
        if data.len() != self.len {
            return Err(DeviceError::LengthMismatch {
                expected: self.len,
                actual: data.len(),
            });
        }
        let src: &[u8] = bytemuck::cast_slice(data);
        let mut dst = self.bytes.write().map_err(transfer_error)?;
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn fill(&self, value: T) -> Result<(), DeviceError> {
        let element = bytemuck::bytes_of(&value);
        let mut dst = self.bytes.write().map_err(transfer_error)?;
        for chunk in dst.chunks_exact_mut(element.len()).take(self.len) {
            chunk.copy_from_slice(element);
        }
        Ok(())
    }

    fn read(&self) -> Result<Vec<T>, DeviceError> {
        let src = self.bytes.read().map_err(transfer_error)?;
        let bytes = &src[..self.len * size_of::<T>()];
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }
}

/// Bottom and top level structures over the whole scene; absent when the device has no ray
/// query support or the scene is empty.
#[derive(Clone)]
pub struct VulkanAccel {
    top_level: Option<Arc<AccelerationStructure>>,
    // the TLAS references it by device address
    _bottom_level: Option<Arc<AccelerationStructure>>,
    triangle_count: usize,
}

impl VulkanAccel {
    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    pub fn is_hardware(&self) -> bool {
        self.top_level.is_some()
    }
}

/// A loaded compute pipeline. `uses_accel` tells whether the kernel reads binding 19.
pub struct VulkanProgram {
    pipeline: Arc<ComputePipeline>,
    uses_accel: bool,
}

fn build_flags(flags: AccelBuildFlags) -> BuildAccelerationStructureFlags {
    match flags {
        AccelBuildFlags::PreferFastBuild => BuildAccelerationStructureFlags::PREFER_FAST_BUILD,
        AccelBuildFlags::PreferFastTrace => BuildAccelerationStructureFlags::PREFER_FAST_TRACE,
    }
}

fn create_acceleration_structure(
    memory_allocator: Arc<dyn MemoryAllocator>,
    ty: AccelerationStructureType,
    size: DeviceSize,
) -> Result<Arc<AccelerationStructure>, DeviceError> {
    let buffer = Buffer::new_slice::<u8>(
        memory_allocator.clone(),
        BufferCreateInfo {
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
            ..Default::default()
        },
        size,
    )
    .map_err(accel_error)?;

    // SAFETY: the structure is only read after the build command that fills it has completed.
    unsafe {
        AccelerationStructure::new(
            memory_allocator.device().clone(),
            AccelerationStructureCreateInfo {
                ty,
                ..AccelerationStructureCreateInfo::new(buffer)
            },
        )
    }
    .map_err(accel_error)
}

fn create_scratch_buffer(
    memory_allocator: Arc<dyn MemoryAllocator>,
    size: DeviceSize,
) -> Result<Subbuffer<[u8]>, DeviceError> {
    let alignment = memory_allocator
        .device()
        .physical_device()
        .properties()
        .min_acceleration_structure_scratch_offset_alignment
        .unwrap_or(1)
        .max(1) as DeviceSize;

    let buffer = Buffer::new_slice::<u8>(
        memory_allocator,
        BufferCreateInfo {
            usage: BufferUsage::STORAGE_BUFFER | BufferUsage::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
            ..Default::default()
        },
        size + alignment,
    )
    .map_err(accel_error)?;

    let address: DeviceSize = buffer
        .device_address()
        .map_err(accel_error)?
        .get();
    let offset = (alignment - address % alignment) % alignment;
    Ok(buffer.slice(offset..offset + size))
}

fn build_acceleration_structure(
    shared: &VulkanShared,
    ty: AccelerationStructureType,
    mut build_info: AccelerationStructureBuildGeometryInfo,
    primitive_count: u32,
) -> Result<Arc<AccelerationStructure>, DeviceError> {
    let memory_allocator: Arc<dyn MemoryAllocator> = shared.memory_allocator.clone();
    let AccelerationStructureBuildSizesInfo {
        acceleration_structure_size,
        build_scratch_size,
        ..
    } = shared
        .device
        .acceleration_structure_build_sizes(
            AccelerationStructureBuildType::Device,
            &build_info,
            &[primitive_count],
        )
        .map_err(accel_error)?;

    let acceleration_structure =
        create_acceleration_structure(memory_allocator.clone(), ty, acceleration_structure_size)?;
    build_info.dst_acceleration_structure = Some(acceleration_structure.clone());
    build_info.scratch_data = Some(create_scratch_buffer(memory_allocator, build_scratch_size)?);

    let mut builder = shared.command_builder()?;
    // SAFETY: geometry buffers are kept alive by the build info until the submission
    // completes, which `submit_and_wait` blocks on.
    unsafe {
        builder
            .build_acceleration_structure(
                build_info,
                [AccelerationStructureBuildRangeInfo {
                    primitive_count,
                    primitive_offset: 0,
                    first_vertex: 0,
                    transform_offset: 0,
                }]
                .into_iter()
                .collect(),
            )
            .map_err(accel_error)?;
    }
    shared.submit_and_wait(builder)?;
    Ok(acceleration_structure)
}

impl Backend for VulkanDevice {
    type Buffer<T: DeviceData> = VulkanBuffer<T>;
    type Binding<T: DeviceData> = VulkanBinding<T>;
    type Texture = Arc<ImageView>;
    type Accel = VulkanAccel;
    type Program = VulkanProgram;
    type Stream = VulkanStream;

    fn info(&self) -> DeviceInfo {
        let properties = self.shared.device.physical_device().properties();
        DeviceInfo {
            name: properties.device_name.clone(),
            target: format!(
                "vulkan-{}-driver-{}",
                self.shared.device.physical_device().api_version(),
                properties.driver_version
            ),
            supports_hardware_acceleration: self.shared.supports_ray_query,
        }
    }

    fn alloc<T: DeviceData>(&self, len: usize) -> Result<VulkanBuffer<T>, DeviceError> {
        let buffer = VulkanBuffer {
            bytes: self
                .shared
                .host_visible_bytes((len * size_of::<T>()) as DeviceSize)
                .map_err(allocation_error(len))?,
            len,
            _marker: PhantomData,
        };
        buffer.fill(T::zeroed())?;
        Ok(buffer)
    }

    fn upload<T: DeviceData>(&self, data: &[T]) -> Result<VulkanBuffer<T>, DeviceError> {
        let buffer = VulkanBuffer {
            bytes: self
                .shared
                .host_visible_bytes(size_of_val(data) as DeviceSize)
                .map_err(allocation_error(data.len()))?,
            len: data.len(),
            _marker: PhantomData,
        };
        buffer.write(data)?;
        Ok(buffer)
    }

    fn upload_texture(&self, texture: &TextureImage) -> Result<Arc<ImageView>, DeviceError> {
        let shared = &self.shared;
        upload_image(
            &shared.memory_allocator,
            &shared.command_buffer_allocator,
            &shared.queue,
            texture,
        )
    }

    fn build_acceleration_structure(
        &self,
        positions: &VulkanBuffer<[f32; 3]>,
        indices: &VulkanBuffer<u32>,
        flags: AccelBuildFlags,
    ) -> Result<VulkanAccel, DeviceError> {
        if indices.len() % 3 != 0 {
            return Err(DeviceError::AccelerationStructure(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(p) = positions
            .read()?
            .into_iter()
            .find(|p| p.iter().any(|c| !c.is_finite()))
        {
            return Err(DeviceError::AccelerationStructure(format!(
                "non-finite vertex position {p:?}"
            )));
        }
        let triangle_count = indices.len() / 3;
        if !self.shared.supports_ray_query || triangle_count == 0 {
            return Ok(VulkanAccel {
                top_level: None,
                _bottom_level: None,
                triangle_count,
            });
        }

        let start = Instant::now();
        let triangles = AccelerationStructureGeometryTrianglesData {
            flags: GeometryFlags::OPAQUE,
            vertex_data: Some(positions.bytes.clone()),
            vertex_stride: size_of::<[f32; 3]>() as u32,
            max_vertex: positions.len().saturating_sub(1) as u32,
            index_data: Some(IndexBuffer::U32(
                indices
                    .bytes
                    .clone()
                    .slice(..(indices.len() * size_of::<u32>()) as DeviceSize)
                    .reinterpret::<[u32]>(),
            )),
            transform_data: None,
            ..AccelerationStructureGeometryTrianglesData::new(Format::R32G32B32_SFLOAT)
        };
        let bottom_level = build_acceleration_structure(
            &self.shared,
            AccelerationStructureType::BottomLevel,
            AccelerationStructureBuildGeometryInfo {
                flags: build_flags(flags),
                mode: BuildAccelerationStructureMode::Build,
                ..AccelerationStructureBuildGeometryInfo::new(
                    AccelerationStructureGeometries::Triangles(vec![triangles]),
                )
            },
            triangle_count as u32,
        )?;

        let identity = AccelerationStructureInstance {
            instance_shader_binding_table_record_offset_and_flags: Packed24_8::new(0, 0),
            acceleration_structure_reference: bottom_level.device_address().get(),
            transform: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            ..Default::default()
        };
        let instances = Buffer::from_iter(
            self.shared.memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
                    | BufferUsage::SHADER_DEVICE_ADDRESS,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                    | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            [identity],
        )
        .map_err(accel_error)?;
        let top_level = build_acceleration_structure(
            &self.shared,
            AccelerationStructureType::TopLevel,
            AccelerationStructureBuildGeometryInfo {
                flags: build_flags(flags),
                mode: BuildAccelerationStructureMode::Build,
                ..AccelerationStructureBuildGeometryInfo::new(
                    AccelerationStructureGeometries::Instances(
                        AccelerationStructureGeometryInstancesData {
                            flags: GeometryFlags::OPAQUE,
                            ..AccelerationStructureGeometryInstancesData::new(
                                AccelerationStructureGeometryInstancesDataType::Values(Some(
                                    instances,
                                )),
                            )
                        },
                    ),
                )
            },
            1,
        )?;

        debug!(
            triangles = triangle_count,
            ?flags,
            elapsed_us = start.elapsed().as_micros() as u64,
            "built Vulkan acceleration structure"
        );
        Ok(VulkanAccel {
            top_level: Some(top_level),
            _bottom_level: Some(bottom_level),
            triangle_count,
        })
    }

    fn compile_program(
        &self,
        source: &KernelSource,
        options: &CompilerOptions,
    ) -> Result<Vec<u8>, DeviceError> {
        let fail = |message: String| DeviceError::Compilation(message);
        let compiler =
            shaderc::Compiler::new().ok_or_else(|| fail("shaderc is unavailable".to_owned()))?;
        let mut compile_options = shaderc::CompileOptions::new()
            .ok_or_else(|| fail("shaderc is unavailable".to_owned()))?;
        compile_options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_2 as u32,
        );
        compile_options.set_target_spirv(shaderc::SpirvVersion::V1_4);
        compile_options.set_optimization_level(shaderc::OptimizationLevel::Performance);
        for (name, value) in options.macros() {
            compile_options.add_macro_definition(name, Some(&value.to_string()));
        }

        let artifact = compiler
            .compile_into_spirv(
                &source.text,
                shaderc::ShaderKind::Compute,
                &format!("{}.comp", source.name),
                &source.entry_point,
                Some(&compile_options),
            )
            .map_err(|e| fail(e.to_string()))?;
        if artifact.get_num_warnings() > 0 {
            warn!(
                kernel = %source.name,
                warnings = %artifact.get_warning_messages(),
                "kernel compiled with warnings"
            );
        }
        Ok(artifact.as_binary_u8().to_vec())
    }

    fn load_program(&self, binary: &[u8]) -> Result<VulkanProgram, DeviceError> {
        if binary.is_empty() || binary.len() % 4 != 0 {
            return Err(DeviceError::InvalidProgram(format!(
                "SPIR-V binary of {} bytes is not a word stream",
                binary.len()
            )));
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(binary);
        // SAFETY: the words come from shaderc, or from a cache entry keyed on the source that
        // shaderc produced them from.
        let module = unsafe {
            ShaderModule::new(self.shared.device.clone(), ShaderModuleCreateInfo::new(&words))
        }
        .map_err(|e| DeviceError::InvalidProgram(e.to_string()))?;

        let pipeline = create_compute_pipeline(self.shared.device.clone(), module, true)?;
        let uses_accel = pipeline
            .layout()
            .set_layouts()
            .first()
            .is_some_and(|set| set.bindings().contains_key(&ACCEL_BINDING));
        Ok(VulkanProgram {
            pipeline,
            uses_accel,
        })
    }

    fn create_stream(&self) -> Result<VulkanStream, DeviceError> {
        Ok(VulkanStream {
            shared: self.shared.clone(),
            pending: VecDeque::new(),
        })
    }

    fn resolve_display(
        &self,
        color: &VulkanBuffer<[f32; 3]>,
        params: ResolveParams,
    ) -> Result<Vec<[u8; 4]>, DeviceError> {
        let shared = &self.shared;
        let pixels = (params.width * params.height) as usize;
        let output = self.alloc::<u32>(pixels)?;

        let pipeline = shared.resolve_pipeline.clone();
        let layout = pipeline.layout().clone();
        let set_layout = layout
            .set_layouts()
            .first()
            .cloned()
            .ok_or_else(|| DeviceError::InvalidProgram("resolve pipeline has no set".to_owned()))?;
        let set = DescriptorSet::new(
            shared.descriptor_set_allocator.clone(),
            set_layout,
            [
                WriteDescriptorSet::buffer(0, color.bytes.clone()),
                WriteDescriptorSet::buffer(1, output.bytes.clone()),
            ],
            [],
        )
        .map_err(launch_error)?;

        let mut builder = shared.command_builder()?;
        builder
            .bind_pipeline_compute(pipeline)
            .map_err(launch_error)?
            .bind_descriptor_sets(PipelineBindPoint::Compute, layout.clone(), 0, set)
            .map_err(launch_error)?
            .push_constants(
                layout,
                0,
                resolve_shader::ResolveConstants {
                    width: params.width,
                    height: params.height,
                    sample_number: params.sample_number,
                    exposure: params.exposure,
                    block_size: params.block_size.max(1),
                },
            )
            .map_err(launch_error)?;
        // SAFETY: the shader bounds-checks the invocation against `width` and `height`.
        unsafe {
            builder
                .dispatch([
                    params.width.div_ceil(WORKGROUP_SIZE),
                    params.height.div_ceil(WORKGROUP_SIZE),
                    1,
                ])
                .map_err(launch_error)?;
        }
        shared.submit_and_wait(builder)?;

        Ok(output
            .read()?
            .into_iter()
            .map(u32::to_le_bytes)
            .collect())
    }
}

struct PendingLaunch {
    fence: FenceSignalFuture<Box<dyn GpuFuture + Send + Sync>>,
    signal: CompletionSignal,
    submitted: Instant,
    // the bindings stay referenced until the fence signals
    _view: RenderView<VulkanDevice>,
}

impl PendingLaunch {
    fn finish(self) {
        self.signal.complete(self.submitted.elapsed());
    }
}

/// Launches submitted to the device queue, retired in order as their fences signal.
pub struct VulkanStream {
    shared: Arc<VulkanShared>,
    pending: VecDeque<PendingLaunch>,
}

impl VulkanStream {
    fn descriptor_writes(
        &self,
        program: &VulkanProgram,
        view: &RenderView<VulkanDevice>,
        params: Subbuffer<[u8]>,
        camera: Subbuffer<[u8]>,
    ) -> Result<Vec<WriteDescriptorSet>, DeviceError> {
        let shared = &self.shared;
        let scene = &view.scene;
        let frame = &view.frame;
        let status = &view.status;
        let dummy = || shared.dummy_buffer.clone();

        let mut writes = vec![
            WriteDescriptorSet::buffer(0, params),
            WriteDescriptorSet::buffer(1, camera),
            WriteDescriptorSet::buffer(2, scene.triangle_indices.bytes.clone()),
            WriteDescriptorSet::buffer(3, scene.vertex_positions.bytes.clone()),
            WriteDescriptorSet::buffer(4, scene.has_vertex_normals.bytes.clone()),
            WriteDescriptorSet::buffer(5, scene.vertex_normals.bytes.clone()),
            WriteDescriptorSet::buffer(6, scene.texcoords.bytes.clone()),
            WriteDescriptorSet::buffer(7, scene.material_indices.bytes.clone()),
            WriteDescriptorSet::buffer(8, scene.materials.bytes.clone()),
            WriteDescriptorSet::buffer(9, scene.emissive_triangle_indices.bytes.clone()),
            WriteDescriptorSet::buffer(10, frame.color.bytes.clone()),
            WriteDescriptorSet::buffer(11, frame.denoiser_normals.bytes.clone()),
            WriteDescriptorSet::buffer(12, frame.denoiser_albedo.bytes.clone()),
            WriteDescriptorSet::buffer(
                13,
                frame
                    .sample_counts
                    .as_ref()
                    .map_or_else(dummy, |b| b.bytes.clone()),
            ),
            WriteDescriptorSet::buffer(
                14,
                frame
                    .squared_luminance
                    .as_ref()
                    .map_or_else(dummy, |b| b.bytes.clone()),
            ),
            WriteDescriptorSet::buffer(15, status.still_one_ray_active.bytes.clone()),
            WriteDescriptorSet::buffer(16, status.pixel_converged_count.bytes.clone()),
            WriteDescriptorSet::buffer(17, status.invalid_sample_count.bytes.clone()),
            WriteDescriptorSet::buffer(
                18,
                view.environment
                    .as_ref()
                    .map_or_else(dummy, |e| e.cdf.bytes.clone()),
            ),
            WriteDescriptorSet::image_view_sampler(
                ENVMAP_BINDING,
                view.environment
                    .as_ref()
                    .map_or_else(|| shared.dummy_texture.clone(), |e| e.texture.clone()),
                shared.sampler.clone(),
            ),
        ];

        let textures = if scene.textures.is_empty() {
            vec![shared.dummy_texture.clone()]
        } else {
            scene.textures.clone()
        };
        writes.push(WriteDescriptorSet::image_view_sampler_array(
            TEXTURES_BINDING,
            0,
            textures
                .into_iter()
                .map(|texture| (texture, shared.sampler.clone())),
        ));

        if program.uses_accel {
            let top_level = scene.accel.top_level.clone().ok_or_else(|| {
                DeviceError::Launch(
                    "kernel traces hardware rays but the scene has no acceleration structure"
                        .to_owned(),
                )
            })?;
            writes.push(WriteDescriptorSet::acceleration_structure(
                ACCEL_BINDING,
                top_level,
            ));
        }

        // the compiler drops bindings the kernel never touches
        let layout = &program.pipeline.layout().set_layouts()[0];
        writes.retain(|write| layout.bindings().contains_key(&write.binding()));
        Ok(writes)
    }

    fn retire_finished(&mut self) -> Result<(), DeviceError> {
        while let Some(front) = self.pending.front() {
            match front.fence.is_signaled() {
                Ok(true) => {
                    if let Some(launch) = self.pending.pop_front() {
                        launch.finish();
                    }
                }
                Ok(false) => break,
                Err(_) => return Err(DeviceError::StreamLost),
            }
        }
        Ok(())
    }
}

impl ComputeStream<VulkanDevice> for VulkanStream {
    fn launch(
        &mut self,
        program: &VulkanProgram,
        view: RenderView<VulkanDevice>,
    ) -> Result<FrameCompletion, DeviceError> {
        let shared = self.shared.clone();
        let params = shared
            .host_visible_bytes(size_of_val(&view.params) as DeviceSize)
            .map_err(launch_error)?;
        params.write().map_err(transfer_error)?[..size_of_val(&view.params)]
            .copy_from_slice(bytemuck::bytes_of(&view.params));
        let camera = shared
            .host_visible_bytes(size_of_val(&view.camera) as DeviceSize)
            .map_err(launch_error)?;
        camera.write().map_err(transfer_error)?[..size_of_val(&view.camera)]
            .copy_from_slice(bytemuck::bytes_of(&view.camera));

        let writes = self.descriptor_writes(program, &view, params, camera)?;
        let texture_count = view.scene.textures.len().max(1) as u32;
        let set_layout = program.pipeline.layout().set_layouts()[0].clone();
        let set = DescriptorSet::new_variable(
            shared.descriptor_set_allocator.clone(),
            set_layout,
            texture_count,
            writes,
            [],
        )
        .map_err(launch_error)?;

        let mut builder = shared.command_builder()?;
        builder
            .bind_pipeline_compute(program.pipeline.clone())
            .map_err(launch_error)?
            .bind_descriptor_sets(
                PipelineBindPoint::Compute,
                program.pipeline.layout().clone(),
                0,
                set,
            )
            .map_err(launch_error)?;
        // SAFETY: the kernel discards invocations outside `width` x `height`, and every buffer
        // it indexes was sized by the scheduler for the bound resolution and scene.
        unsafe {
            builder
                .dispatch([
                    view.params.width.div_ceil(WORKGROUP_SIZE),
                    view.params.height.div_ceil(WORKGROUP_SIZE),
                    1,
                ])
                .map_err(launch_error)?;
        }
        let command_buffer = builder.build().map_err(launch_error)?;

        let submitted = Instant::now();
        let fence = sync::now(shared.device.clone())
            .then_execute(shared.queue.clone(), command_buffer)
            .map_err(launch_error)?
            .boxed_send_sync()
            .then_signal_fence_and_flush()
            .map_err(launch_error)?;

        let (signal, completion) = completion_pair();
        self.pending.push_back(PendingLaunch {
            fence,
            signal,
            submitted,
            _view: view,
        });
        Ok(completion)
    }

    fn query(&mut self) -> Result<bool, DeviceError> {
        self.retire_finished()?;
        Ok(self.pending.is_empty())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        while let Some(launch) = self.pending.pop_front() {
            launch.fence.wait(None).map_err(|_| DeviceError::StreamLost)?;
            launch.finish();
        }
        Ok(())
    }
}

impl Drop for VulkanStream {
    fn drop(&mut self) {
        if let Err(e) = self.synchronize() {
            warn!(error = %e, "dropping a Vulkan stream with unfinished launches");
        }
    }
}
