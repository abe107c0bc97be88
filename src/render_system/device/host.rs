//! Software accelerator: buffers live in host memory, launches run on a worker thread that
//! fans pixels out over a rayon pool.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::render_system::{
    bvh::Bvh,
    device::{
        AccelBuildFlags, Backend, CompletionSignal, ComputeStream, DeviceBuffer, DeviceData,
        DeviceError, DeviceInfo, FrameCompletion, RenderView, completion_pair,
    },
    envmap::EnvironmentData,
    kernel::{self, FrameTargets, KernelConfig, KernelContext, SceneData, StatusCounters},
    kernel_compiler::{CompilerOptions, KernelSource},
    scene::TextureImage,
};

const PROGRAM_FORMAT: &str = "host-kernel";
const PROGRAM_VERSION: u32 = 1;

#[derive(Clone, Debug, Default)]
pub struct HostDeviceOptions {
    // 0 uses the global rayon pool
    pub worker_threads: usize,
}

/// Allocation bookkeeping, recorded for every buffer the device hands out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryEvent {
    Alloc { id: u64, len: usize },
    // `in_flight` is set when the owner went away while a launch still referenced the buffer
    Free { id: u64, in_flight: bool },
}

struct HostShared {
    next_buffer_id: AtomicU64,
    memory_events: Mutex<Vec<MemoryEvent>>,
    // buffer id -> number of queued or running launches binding it
    in_flight: Mutex<HashMap<u64, usize>>,
    holds: Mutex<usize>,
    hold_released: Condvar,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl HostShared {
    fn record(&self, event: MemoryEvent) {
        trace!(?event, "host memory event");
        self.memory_events.lock().push(event);
    }

    fn wait_for_holds(&self) {
        let mut holds = self.holds.lock();
        while *holds > 0 {
            self.hold_released.wait(&mut holds);
        }
    }
}

#[derive(Clone)]
pub struct HostDevice {
    shared: Arc<HostShared>,
}

impl Default for HostDevice {
    fn default() -> Self {
        HostDevice::new()
    }
}

impl HostDevice {
    pub fn new() -> HostDevice {
        HostDevice::from_pool(None)
    }

    pub fn with_options(options: HostDeviceOptions) -> Result<HostDevice, DeviceError> {
        if options.worker_threads == 0 {
            return Ok(HostDevice::new());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.worker_threads)
            .thread_name(|i| format!("host-kernel-{i}"))
            .build()
            .map_err(|e| DeviceError::NoSuitableDevice(e.to_string()))?;
        Ok(HostDevice::from_pool(Some(Arc::new(pool))))
    }

    fn from_pool(pool: Option<Arc<rayon::ThreadPool>>) -> HostDevice {
        HostDevice {
            shared: Arc::new(HostShared {
                next_buffer_id: AtomicU64::new(0),
                memory_events: Mutex::new(vec![]),
                in_flight: Mutex::new(HashMap::new()),
                holds: Mutex::new(0),
                hold_released: Condvar::new(),
                pool,
            }),
        }
    }

    /// Launches submitted while the returned guard is alive stay queued until it is dropped.
    pub fn hold_stream(&self) -> StreamHold {
        *self.shared.holds.lock() += 1;
        StreamHold {
            shared: self.shared.clone(),
        }
    }

    pub fn memory_events(&self) -> Vec<MemoryEvent> {
        self.shared.memory_events.lock().clone()
    }

    pub fn clear_memory_events(&self) {
        self.shared.memory_events.lock().clear();
    }

    fn wrap<T: DeviceData>(&self, data: Vec<T>) -> HostBuffer<T> {
        let id = self.shared.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        self.shared.record(MemoryEvent::Alloc { id, len: data.len() });
        HostBuffer {
            allocation: Arc::new(HostAllocation {
                id,
                data: RwLock::new(data),
            }),
            shared: self.shared.clone(),
        }
    }
}

pub struct StreamHold {
    shared: Arc<HostShared>,
}

impl StreamHold {
    pub fn release(self) {}
}

impl Drop for StreamHold {
    fn drop(&mut self) {
        let mut holds = self.shared.holds.lock();
        *holds -= 1;
        self.shared.hold_released.notify_all();
    }
}

struct HostAllocation<T> {
    id: u64,
    data: RwLock<Vec<T>>,
}

pub struct HostBuffer<T: DeviceData> {
    allocation: Arc<HostAllocation<T>>,
    shared: Arc<HostShared>,
}

impl<T: DeviceData> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        let id = self.allocation.id;
        let in_flight = self.shared.in_flight.lock().contains_key(&id);
        if in_flight {
            error!(id, "buffer released while bound to an in-flight launch");
        }
        self.shared.record(MemoryEvent::Free { id, in_flight });
    }
}

/// Shared reference to a host allocation, held by launches.
pub struct HostBinding<T> {
    allocation: Arc<HostAllocation<T>>,
}

impl<T> Clone for HostBinding<T> {
    fn clone(&self) -> Self {
        HostBinding {
            allocation: self.allocation.clone(),
        }
    }
}

impl<T> HostBinding<T> {
    pub fn id(&self) -> u64 {
        self.allocation.id
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.allocation.data.read()
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.allocation.data.write()
    }
}

impl<T: DeviceData> HostBuffer<T> {
    pub fn id(&self) -> u64 {
        self.allocation.id
    }
}

impl<T: DeviceData> DeviceBuffer<T> for HostBuffer<T> {
    type Binding = HostBinding<T>;

    fn len(&self) -> usize {
        self.allocation.data.read().len()
    }

    fn binding(&self) -> HostBinding<T> {
        HostBinding {
            allocation: self.allocation.clone(),
        }
    }

    fn write(&self, data: &[T]) -> Result<(), DeviceError> {
        let mut dst = self.allocation.data.write();
        if dst.len() != data.len() {
            return Err(DeviceError::LengthMismatch {
                expected: dst.len(),
                actual: data.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn fill(&self, value: T) -> Result<(), DeviceError> {
        self.allocation.data.write().fill(value);
        Ok(())
    }

    fn read(&self) -> Result<Vec<T>, DeviceError> {
        Ok(self.allocation.data.read().clone())
    }
}

#[derive(Serialize, Deserialize)]
struct HostProgramBinary {
    format: String,
    version: u32,
    kernel: String,
    entry_point: String,
    config: KernelConfig,
}

/// A "compiled" host kernel: the configuration its macros resolved to.
#[derive(Clone, Debug)]
pub struct HostProgram {
    pub kernel: String,
    pub config: KernelConfig,
}

impl Backend for HostDevice {
    type Buffer<T: DeviceData> = HostBuffer<T>;
    type Binding<T: DeviceData> = HostBinding<T>;
    type Texture = Arc<TextureImage>;
    type Accel = Arc<Bvh>;
    type Program = HostProgram;
    type Stream = HostStream;

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "host".to_owned(),
            target: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            supports_hardware_acceleration: true,
        }
    }

    fn alloc<T: DeviceData>(&self, len: usize) -> Result<HostBuffer<T>, DeviceError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| DeviceError::Allocation {
                len,
                message: e.to_string(),
            })?;
        data.resize(len, T::zeroed());
        Ok(self.wrap(data))
    }

    fn upload<T: DeviceData>(&self, data: &[T]) -> Result<HostBuffer<T>, DeviceError> {
        Ok(self.wrap(data.to_vec()))
    }

    fn upload_texture(&self, texture: &TextureImage) -> Result<Arc<TextureImage>, DeviceError> {
        if texture.width() == 0 || texture.height() == 0 {
            return Err(DeviceError::Texture("texture has no texels".to_owned()));
        }
        Ok(Arc::new(texture.clone()))
    }

    fn build_acceleration_structure(
        &self,
        positions: &HostBuffer<[f32; 3]>,
        indices: &HostBuffer<u32>,
        flags: AccelBuildFlags,
    ) -> Result<Arc<Bvh>, DeviceError> {
        let positions = positions.allocation.data.read();
        let indices = indices.allocation.data.read();
        if indices.len() % 3 != 0 {
            return Err(DeviceError::AccelerationStructure(format!(
                "index count {} is not a multiple of 3",
                indices.len()
            )));
        }
        if let Some(p) = positions.iter().find(|p| p.iter().any(|c| !c.is_finite())) {
            return Err(DeviceError::AccelerationStructure(format!(
                "non-finite vertex position {p:?}"
            )));
        }
        let triangles = indices
            .chunks_exact(3)
            .map(|tri| {
                let mut out = [nalgebra::Point3::origin(); 3];
                for (dst, &i) in out.iter_mut().zip(tri) {
                    let p = positions.get(i as usize).ok_or_else(|| {
                        DeviceError::AccelerationStructure(format!("vertex index {i} out of range"))
                    })?;
                    *dst = nalgebra::Point3::from(*p);
                }
                Ok(out)
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        let start = Instant::now();
        let bvh = Bvh::build(triangles, flags);
        debug!(
            triangles = bvh.triangle_count(),
            nodes = bvh.nodes().len(),
            ?flags,
            elapsed_us = start.elapsed().as_micros() as u64,
            "built host acceleration structure"
        );
        Ok(Arc::new(bvh))
    }

    fn compile_program(
        &self,
        source: &KernelSource,
        options: &CompilerOptions,
    ) -> Result<Vec<u8>, DeviceError> {
        let config = KernelConfig::from_options(options)?;
        let binary = HostProgramBinary {
            format: PROGRAM_FORMAT.to_owned(),
            version: PROGRAM_VERSION,
            kernel: source.name.clone(),
            entry_point: source.entry_point.clone(),
            config,
        };
        serde_json::to_vec(&binary).map_err(|e| DeviceError::Compilation(e.to_string()))
    }

    fn load_program(&self, binary: &[u8]) -> Result<HostProgram, DeviceError> {
        let binary: HostProgramBinary = serde_json::from_slice(binary)
            .map_err(|e| DeviceError::InvalidProgram(e.to_string()))?;
        if binary.format != PROGRAM_FORMAT || binary.version != PROGRAM_VERSION {
            return Err(DeviceError::InvalidProgram(format!(
                "unsupported program format {} v{}",
                binary.format, binary.version
            )));
        }
        Ok(HostProgram {
            kernel: binary.kernel,
            config: binary.config,
        })
    }

    fn create_stream(&self) -> Result<HostStream, DeviceError> {
        HostStream::new(self.shared.clone())
    }
}

struct LaunchJob {
    config: KernelConfig,
    view: RenderView<HostDevice>,
    signal: CompletionSignal,
    buffer_ids: Vec<u64>,
}

#[derive(Default)]
struct StreamProgress {
    completed: Mutex<u64>,
    finished: Condvar,
    lost: AtomicBool,
}

/// In-order queue of launches executed by one worker thread.
pub struct HostStream {
    sender: Option<Sender<LaunchJob>>,
    worker: Option<JoinHandle<()>>,
    progress: Arc<StreamProgress>,
    shared: Arc<HostShared>,
    submitted: u64,
}

impl HostStream {
    fn new(shared: Arc<HostShared>) -> Result<HostStream, DeviceError> {
        let (sender, receiver) = mpsc::channel();
        let progress = Arc::new(StreamProgress::default());
        let worker = {
            let progress = progress.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name("host-stream".to_owned())
                .spawn(move || stream_worker(receiver, shared, progress))
                .map_err(|e| DeviceError::NoSuitableDevice(e.to_string()))?
        };
        Ok(HostStream {
            sender: Some(sender),
            worker: Some(worker),
            progress,
            shared,
            submitted: 0,
        })
    }
}

fn stream_worker(receiver: Receiver<LaunchJob>, shared: Arc<HostShared>, progress: Arc<StreamProgress>) {
    for job in receiver {
        shared.wait_for_holds();

        let start = Instant::now();
        if !progress.lost.load(Ordering::Acquire) {
            let run = || execute(&job.config, &job.view);
            let result = panic::catch_unwind(AssertUnwindSafe(|| match &shared.pool {
                Some(pool) => pool.install(run),
                None => run(),
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "host launch failed");
                    progress.lost.store(true, Ordering::Release);
                }
                Err(_) => {
                    error!("host launch panicked");
                    progress.lost.store(true, Ordering::Release);
                }
            }
        }
        let elapsed = start.elapsed();

        {
            let mut in_flight = shared.in_flight.lock();
            for id in &job.buffer_ids {
                if let Some(count) = in_flight.get_mut(id) {
                    *count -= 1;
                    if *count == 0 {
                        in_flight.remove(id);
                    }
                }
            }
        }
        // drop the bindings before signalling so the owner may free right after
        let LaunchJob { view, signal, .. } = job;
        drop(view);
        signal.complete(elapsed);

        let mut completed = progress.completed.lock();
        *completed += 1;
        progress.finished.notify_all();
    }
}

fn view_buffer_ids(view: &RenderView<HostDevice>) -> Vec<u64> {
    let scene = &view.scene;
    let frame = &view.frame;
    let status = &view.status;
    let mut ids = vec![
        scene.triangle_indices.id(),
        scene.vertex_positions.id(),
        scene.has_vertex_normals.id(),
        scene.vertex_normals.id(),
        scene.texcoords.id(),
        scene.material_indices.id(),
        scene.materials.id(),
        scene.emissive_triangle_indices.id(),
        frame.color.id(),
        frame.denoiser_normals.id(),
        frame.denoiser_albedo.id(),
        status.still_one_ray_active.id(),
        status.pixel_converged_count.id(),
        status.invalid_sample_count.id(),
    ];
    ids.extend(frame.sample_counts.as_ref().map(|b| b.id()));
    ids.extend(frame.squared_luminance.as_ref().map(|b| b.id()));
    ids.extend(view.environment.as_ref().map(|e| e.cdf.id()));
    ids
}

fn check_len(actual: usize, expected: usize) -> Result<(), DeviceError> {
    if actual < expected {
        return Err(DeviceError::LengthMismatch { expected, actual });
    }
    Ok(())
}

fn execute(config: &KernelConfig, view: &RenderView<HostDevice>) -> Result<(), DeviceError> {
    let params = &view.params;
    let pixels = params.width as usize * params.height as usize;

    let scene = &view.scene;
    let triangle_indices = scene.triangle_indices.read_lock();
    let vertex_positions = scene.vertex_positions.read_lock();
    let has_vertex_normals = scene.has_vertex_normals.read_lock();
    let vertex_normals = scene.vertex_normals.read_lock();
    let texcoords = scene.texcoords.read_lock();
    let material_indices = scene.material_indices.read_lock();
    let materials = scene.materials.read_lock();
    let emissive_triangle_indices = scene.emissive_triangle_indices.read_lock();

    let environment_cdf = view.environment.as_ref().map(|e| (e.texture.clone(), e.cdf.read_lock()));
    let environment = environment_cdf.as_ref().map(|(texture, cdf)| EnvironmentData {
        image: texture.as_ref(),
        cdf: &cdf[..],
    });

    let frame = &view.frame;
    let mut color = frame.color.write_lock();
    let mut normals = frame.denoiser_normals.write_lock();
    let mut albedo = frame.denoiser_albedo.write_lock();
    let mut sample_counts = frame.sample_counts.as_ref().map(|b| b.write_lock());
    let mut squared_luminance = frame.squared_luminance.as_ref().map(|b| b.write_lock());

    check_len(color.len(), pixels)?;
    check_len(normals.len(), pixels)?;
    check_len(albedo.len(), pixels)?;
    if let Some(counts) = &sample_counts {
        check_len(counts.len(), pixels)?;
    }
    if let Some(sq) = &squared_luminance {
        check_len(sq.len(), pixels)?;
    }

    let ctx = KernelContext::new(
        config,
        SceneData {
            triangle_indices: &triangle_indices,
            vertex_positions: &vertex_positions,
            has_vertex_normals: &has_vertex_normals,
            vertex_normals: &vertex_normals,
            texcoords: &texcoords,
            material_indices: &material_indices,
            materials: &materials,
            emissive_triangle_indices: &emissive_triangle_indices,
            textures: &scene.textures,
            accel: &scene.accel,
        },
        environment,
        &view.camera,
        params,
    );

    let counters = StatusCounters::default();
    kernel::render_frame(
        &ctx,
        FrameTargets {
            color: &mut color[..pixels],
            normals: &mut normals[..pixels],
            albedo: &mut albedo[..pixels],
            sample_counts: sample_counts.as_mut().map(|c| &mut c[..pixels]),
            squared_luminance: squared_luminance.as_mut().map(|s| &mut s[..pixels]),
        },
        &counters,
    );

    let status = &view.status;
    let mut still_active = status.still_one_ray_active.write_lock();
    let mut converged = status.pixel_converged_count.write_lock();
    let mut invalid = status.invalid_sample_count.write_lock();
    check_len(still_active.len(), 1)?;
    check_len(converged.len(), 1)?;
    check_len(invalid.len(), 1)?;
    still_active[0] = still_active[0].max(counters.still_one_ray_active.into_inner());
    converged[0] += counters.pixel_converged_count.into_inner();
    invalid[0] += counters.invalid_sample_count.into_inner();
    Ok(())
}

impl ComputeStream<HostDevice> for HostStream {
    fn launch(
        &mut self,
        program: &HostProgram,
        view: RenderView<HostDevice>,
    ) -> Result<FrameCompletion, DeviceError> {
        if self.progress.lost.load(Ordering::Acquire) {
            return Err(DeviceError::StreamLost);
        }
        let sender = self.sender.as_ref().ok_or(DeviceError::StreamLost)?;

        let buffer_ids = view_buffer_ids(&view);
        {
            let mut in_flight = self.shared.in_flight.lock();
            for &id in &buffer_ids {
                *in_flight.entry(id).or_insert(0) += 1;
            }
        }

        let (signal, completion) = completion_pair();
        sender
            .send(LaunchJob {
                config: program.config,
                view,
                signal,
                buffer_ids,
            })
            .map_err(|_| DeviceError::StreamLost)?;
        self.submitted += 1;
        trace!(submitted = self.submitted, kernel = %program.kernel, "enqueued host launch");
        Ok(completion)
    }

    fn query(&mut self) -> Result<bool, DeviceError> {
        if self.progress.lost.load(Ordering::Acquire) {
            return Err(DeviceError::StreamLost);
        }
        Ok(*self.progress.completed.lock() >= self.submitted)
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        let mut completed = self.progress.completed.lock();
        while *completed < self.submitted {
            self.progress.finished.wait(&mut completed);
        }
        drop(completed);
        if self.progress.lost.load(Ordering::Acquire) {
            return Err(DeviceError::StreamLost);
        }
        Ok(())
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // closing the channel ends the worker once the queue drains
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("host stream worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_round_trip_and_reject_length_mismatch() {
        let device = HostDevice::new();
        let buffer = device.upload(&[1u32, 2, 3]).unwrap();
        assert_eq!(buffer.read().unwrap(), vec![1, 2, 3]);
        buffer.write(&[4, 5, 6]).unwrap();
        buffer.fill(9).unwrap();
        assert_eq!(buffer.read().unwrap(), vec![9, 9, 9]);
        assert!(matches!(
            buffer.write(&[1]),
            Err(DeviceError::LengthMismatch { expected: 3, actual: 1 })
        ));
        let zeroed = device.alloc::<f32>(4).unwrap();
        assert_eq!(zeroed.read().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn dropping_buffers_is_recorded() {
        let device = HostDevice::new();
        let buffer = device.alloc::<u32>(8).unwrap();
        let id = buffer.id();
        drop(buffer);
        assert_eq!(
            device.memory_events(),
            vec![
                MemoryEvent::Alloc { id, len: 8 },
                MemoryEvent::Free {
                    id,
                    in_flight: false
                }
            ]
        );
    }

    #[test]
    fn acceleration_structure_rejects_bad_geometry() {
        let device = HostDevice::new();
        let positions = device
            .upload(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [f32::NAN, 1.0, 0.0]])
            .unwrap();
        let indices = device.upload(&[0u32, 1, 2]).unwrap();
        assert!(matches!(
            device.build_acceleration_structure(&positions, &indices, AccelBuildFlags::default()),
            Err(DeviceError::AccelerationStructure(_))
        ));

        let positions = device.upload(&[[0.0f32; 3]; 3]).unwrap();
        let indices = device.upload(&[0u32, 1, 7]).unwrap();
        assert!(
            device
                .build_acceleration_structure(&positions, &indices, AccelBuildFlags::default())
                .is_err()
        );
    }

    #[test]
    fn program_binary_round_trips() {
        let device = HostDevice::new();
        let mut options = CompilerOptions::default();
        options.set_macro(crate::render_system::kernel_compiler::USE_HARDWARE_ACCELERATION, 0);
        let binary = device
            .compile_program(&KernelSource::path_tracer(), &options)
            .unwrap();
        let program = device.load_program(&binary).unwrap();
        assert!(!program.config.use_hardware_acceleration);
        assert!(device.load_program(b"{}").is_err());
    }

    #[test]
    fn hold_blocks_until_released() {
        let device = HostDevice::new();
        let hold = device.hold_stream();
        let shared = device.shared.clone();
        let waiter = thread::spawn(move || shared.wait_for_holds());
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        hold.release();
        waiter.join().unwrap();
    }
}
