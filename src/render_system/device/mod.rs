use std::{
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    time::Duration,
};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    camera::DeviceCamera,
    render_system::{
        envmap::EnvironmentBindings,
        frame_buffers::FrameBindings,
        kernel_compiler::{CompilerOptions, KernelSource},
        scene::TextureImage,
        scene_uploader::SceneBindings,
        settings::KernelParameters,
        status_buffers::StatusBindings,
    },
};

pub mod host;
#[cfg(feature = "vulkan")]
pub mod vulkan;

/// Anything that can be copied bit-for-bit into device memory.
pub trait DeviceData: Pod + Send + Sync + 'static {}

impl<T: Pod + Send + Sync + 'static> DeviceData for T {}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to allocate {len} elements: {message}")]
    Allocation { len: usize, message: String },

    #[error("buffer length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("acceleration structure build failed: {0}")]
    AccelerationStructure(String),

    #[error("{0}")]
    Compilation(String),

    #[error("invalid program binary: {0}")]
    InvalidProgram(String),

    #[error("kernel launch failed: {0}")]
    Launch(String),

    #[error("the compute stream was lost")]
    StreamLost,

    #[error("no suitable device: {0}")]
    NoSuitableDevice(String),

    #[error("texture upload failed: {0}")]
    Texture(String),

    #[error("buffer transfer failed: {0}")]
    Transfer(String),
}

/// Identity of the device a program is compiled for; part of the kernel cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub name: String,
    pub target: String,
    pub supports_hardware_acceleration: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelBuildFlags {
    PreferFastBuild,
    #[default]
    PreferFastTrace,
}

/// Owning handle over a device allocation. Dropping it frees the allocation; in-flight
/// work only ever holds [`DeviceBuffer::Binding`]s.
pub trait DeviceBuffer<T: DeviceData>: Send + Sync {
    type Binding: Clone + Send + Sync + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn binding(&self) -> Self::Binding;

    fn write(&self, data: &[T]) -> Result<(), DeviceError>;

    fn fill(&self, value: T) -> Result<(), DeviceError>;

    fn read(&self) -> Result<Vec<T>, DeviceError>;
}

/// An accelerator: memory, textures, acceleration structures, programs and a compute stream.
pub trait Backend: Send + Sync + Sized + 'static {
    type Buffer<T: DeviceData>: DeviceBuffer<T, Binding = Self::Binding<T>>;
    type Binding<T: DeviceData>: Clone + Send + Sync + 'static;
    type Texture: Clone + Send + Sync + 'static;
    type Accel: Clone + Send + Sync + 'static;
    type Program: Send + Sync + 'static;
    type Stream: ComputeStream<Self>;

    fn info(&self) -> DeviceInfo;

    /// Zero-initialized buffer of `len` elements.
    fn alloc<T: DeviceData>(&self, len: usize) -> Result<Self::Buffer<T>, DeviceError>;

    fn upload<T: DeviceData>(&self, data: &[T]) -> Result<Self::Buffer<T>, DeviceError>;

    fn upload_texture(&self, texture: &TextureImage) -> Result<Self::Texture, DeviceError>;

    /// Opaque acceleration structure service over an indexed triangle list.
    fn build_acceleration_structure(
        &self,
        positions: &Self::Buffer<[f32; 3]>,
        indices: &Self::Buffer<u32>,
        flags: AccelBuildFlags,
    ) -> Result<Self::Accel, DeviceError>;

    /// Produces a program binary suitable for the kernel cache.
    fn compile_program(
        &self,
        source: &KernelSource,
        options: &CompilerOptions,
    ) -> Result<Vec<u8>, DeviceError>;

    fn load_program(&self, binary: &[u8]) -> Result<Self::Program, DeviceError>;

    fn create_stream(&self) -> Result<Self::Stream, DeviceError>;

    /// Converts an accumulated color buffer into 8-bit sRGB pixels. Must not be called while
    /// the buffer is referenced by an in-flight launch.
    fn resolve_display(
        &self,
        color: &Self::Buffer<[f32; 3]>,
        params: ResolveParams,
    ) -> Result<Vec<[u8; 4]>, DeviceError> {
        let color = color.read()?;
        Ok(resolve_pixels(&color, params))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolveParams {
    pub width: u32,
    pub height: u32,
    pub sample_number: u32,
    pub exposure: f32,
    // pixels per block side when the last frame was rendered in low resolution
    pub block_size: u32,
}

pub(crate) fn resolve_pixels(color: &[[f32; 3]], params: ResolveParams) -> Vec<[u8; 4]> {
    use rayon::prelude::*;

    let block = params.block_size.max(1);
    let scale = params.exposure / params.sample_number.max(1) as f32;
    (0..color.len())
        .into_par_iter()
        .map(|idx| {
            let x = idx as u32 % params.width;
            let y = idx as u32 / params.width;
            let src = ((y - y % block) * params.width + (x - x % block)) as usize;
            let c = color[src];
            let encode = |v: f32| (linear_to_srgb(v * scale).clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
            [encode(c[0]), encode(c[1]), encode(c[2]), 255]
        })
        .collect()
}

pub fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.0031308 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

pub trait ComputeStream<B: Backend>: Send {
    /// Enqueues one kernel launch and returns immediately.
    fn launch(
        &mut self,
        program: &B::Program,
        view: RenderView<B>,
    ) -> Result<FrameCompletion, DeviceError>;

    /// Non-blocking: true once every launch enqueued so far has finished.
    fn query(&mut self) -> Result<bool, DeviceError>;

    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

/// Everything one kernel launch reads or writes. Holds bindings only, so the scheduler keeps
/// ownership of every allocation.
pub struct RenderView<B: Backend> {
    pub scene: SceneBindings<B>,
    pub environment: Option<EnvironmentBindings<B>>,
    pub frame: FrameBindings<B>,
    pub status: StatusBindings<B>,
    pub camera: DeviceCamera,
    pub params: KernelParameters,
}

/// Sending half of a frame timing notification, owned by the stream.
pub struct CompletionSignal {
    sender: Sender<Duration>,
}

impl CompletionSignal {
    pub fn complete(self, elapsed: Duration) {
        // the scheduler may have dropped its half after a reset
        let _ = self.sender.send(elapsed);
    }
}

/// Elapsed time of one launch, available once the stream has finished it.
pub struct FrameCompletion {
    receiver: Receiver<Duration>,
    elapsed: Option<Duration>,
}

pub fn completion_pair() -> (CompletionSignal, FrameCompletion) {
    let (sender, receiver) = mpsc::channel();
    (
        CompletionSignal { sender },
        FrameCompletion {
            receiver,
            elapsed: None,
        },
    )
}

impl FrameCompletion {
    pub fn poll(&mut self) -> Option<Duration> {
        if self.elapsed.is_none() {
            match self.receiver.try_recv() {
                Ok(elapsed) => self.elapsed = Some(elapsed),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
        self.elapsed
    }

    pub fn wait(mut self) -> Option<Duration> {
        if self.elapsed.is_none() {
            self.elapsed = self.receiver.recv().ok();
        }
        self.elapsed
    }
}
