pub mod bvh;
pub mod device;
pub mod envmap;
pub mod frame_buffers;
pub mod frame_scheduler;
pub mod kernel;
pub mod kernel_compiler;
pub mod path_trace_shader;
#[cfg(feature = "vulkan")]
mod resolve_shader;
pub mod scene;
pub mod scene_uploader;
pub mod settings;
pub mod status_buffers;
