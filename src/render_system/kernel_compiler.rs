use std::{
    collections::BTreeMap,
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    error::{RenderError, Result},
    render_system::{
        device::{Backend, DeviceError, DeviceInfo},
        path_trace_shader,
    },
};

/// Selects the direct light sampling strategy (see `LightSamplingStrategy`).
pub const DIRECT_LIGHT_SAMPLING_STRATEGY: &str = "DIRECT_LIGHT_SAMPLING_STRATEGY";
/// Selects the environment map sampling strategy (see `EnvmapSamplingStrategy`).
pub const ENVMAP_SAMPLING_STRATEGY: &str = "ENVMAP_SAMPLING_STRATEGY";
/// 1 to trace through the device acceleration structure, 0 for a linear triangle loop.
pub const USE_HARDWARE_ACCELERATION: &str = "USE_HARDWARE_ACCELERATION";

// bump when the binary format of any backend changes
const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelSource {
    pub name: String,
    pub entry_point: String,
    pub text: String,
}

impl KernelSource {
    pub fn path_tracer() -> KernelSource {
        KernelSource {
            name: "path_trace".to_owned(),
            entry_point: "main".to_owned(),
            text: path_trace_shader::SOURCE.to_owned(),
        }
    }
}

/// Preprocessor definitions handed to the kernel compiler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerOptions {
    macros: BTreeMap<String, i32>,
}

impl CompilerOptions {
    pub fn set_macro(&mut self, name: impl Into<String>, value: i32) {
        self.macros.insert(name.into(), value);
    }

    pub fn remove_macro(&mut self, name: &str) {
        self.macros.remove(name);
    }

    pub fn macro_value(&self, name: &str) -> Option<i32> {
        self.macros.get(name).copied()
    }

    pub fn macros(&self) -> impl Iterator<Item = (&str, i32)> {
        self.macros.iter().map(|(name, &value)| (name.as_str(), value))
    }
}

const CACHE_KEY_SEED: u64 = 0x3c6e_f372_fe94_f82b;

/// Hex digest identifying a program binary: xxh3-128 over the length-prefixed source
/// identity, macros and target hardware.
pub fn cache_key(source: &KernelSource, options: &CompilerOptions, device: &DeviceInfo) -> String {
    let mut hasher = Xxh3::with_seed(CACHE_KEY_SEED);
    let mut write_str = |s: &str| {
        hasher.update(&(s.len() as u64).to_le_bytes());
        hasher.update(s.as_bytes());
    };
    write_str(&source.name);
    write_str(&source.entry_point);
    write_str(&source.text);
    for (name, value) in options.macros() {
        write_str(name);
        write_str(&value.to_string());
    }
    write_str(&device.name);
    write_str(&device.target);
    hasher.update(&[u8::from(device.supports_hardware_acceleration)]);
    hasher.update(&CACHE_FORMAT_VERSION.to_le_bytes());
    format!("{:032x}", hasher.digest128())
}

/// On-disk store of compiled program binaries.
#[derive(Clone, Debug)]
pub struct KernelCache {
    directory: Option<PathBuf>,
}

impl KernelCache {
    pub fn new(directory: impl Into<PathBuf>) -> KernelCache {
        KernelCache {
            directory: Some(directory.into()),
        }
    }

    /// Cache that never hits and never stores.
    pub fn disabled() -> KernelCache {
        KernelCache { directory: None }
    }

    pub fn default_location() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("progressive-path-tracer").join("kernels"))
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{key}.bin")))
    }

    pub fn load(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(binary) => Some(binary),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "kernel cache miss");
                None
            }
        }
    }

    pub fn store(&self, key: &str, binary: &[u8]) -> Result<()> {
        let (Some(dir), Some(path)) = (&self.directory, self.entry_path(key)) else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        // write then rename so a concurrent reader never sees a partial binary
        let tmp = dir.join(format!("{key}.{}.tmp", std::process::id()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(binary)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), bytes = binary.len(), "stored kernel binary");
        Ok(())
    }
}

pub struct CompiledProgram<B: Backend> {
    pub program: B::Program,
    pub cache_key: String,
    pub from_cache: bool,
}

/// Compiles kernels for one device, going through the cache.
pub struct KernelCompiler<B: Backend> {
    device: Arc<B>,
    cache: Arc<KernelCache>,
}

impl<B: Backend> Clone for KernelCompiler<B> {
    fn clone(&self) -> Self {
        KernelCompiler {
            device: self.device.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<B: Backend> KernelCompiler<B> {
    pub fn new(device: Arc<B>, cache: KernelCache) -> KernelCompiler<B> {
        KernelCompiler {
            device,
            cache: Arc::new(cache),
        }
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn compile(
        &self,
        source: &KernelSource,
        options: &CompilerOptions,
    ) -> Result<CompiledProgram<B>> {
        let start = Instant::now();
        let key = cache_key(source, options, &self.device.info());

        if let Some(binary) = self.cache.load(&key) {
            match self.device.load_program(&binary) {
                Ok(program) => {
                    info!(kernel = %source.name, key = %key, "loaded kernel from cache");
                    return Ok(CompiledProgram {
                        program,
                        cache_key: key,
                        from_cache: true,
                    });
                }
                Err(e) => {
                    warn!(kernel = %source.name, key = %key, error = %e, "discarding unusable cached kernel");
                }
            }
        }

        let binary = self
            .device
            .compile_program(source, options)
            .map_err(|e| match e {
                DeviceError::Compilation(message) => RenderError::KernelCompilation {
                    name: source.name.clone(),
                    message,
                },
                other => other.into(),
            })?;
        if let Err(e) = self.cache.store(&key, &binary) {
            warn!(key = %key, error = %e, "failed to store kernel in cache");
        }
        let program = self.device.load_program(&binary)?;
        info!(
            kernel = %source.name,
            key = %key,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "compiled kernel"
        );
        Ok(CompiledProgram {
            program,
            cache_key: key,
            from_cache: false,
        })
    }

    /// Compiles on a background thread.
    pub fn spawn(&self, source: KernelSource, options: CompilerOptions) -> Result<PendingCompile<B>> {
        let compiler = self.clone();
        let handle = thread::Builder::new()
            .name("kernel-compiler".to_owned())
            .spawn(move || compiler.compile(&source, &options))?;
        Ok(PendingCompile { handle })
    }
}

pub struct PendingCompile<B: Backend> {
    handle: JoinHandle<Result<CompiledProgram<B>>>,
}

impl<B: Backend> PendingCompile<B> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<CompiledProgram<B>> {
        self.handle
            .join()
            .map_err(|_| RenderError::CompilerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_system::device::host::HostDevice;

    fn compiler(dir: &Path) -> KernelCompiler<HostDevice> {
        KernelCompiler::new(Arc::new(HostDevice::new()), KernelCache::new(dir))
    }

    #[test]
    fn second_compile_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler(dir.path());
        let source = KernelSource::path_tracer();
        let options = CompilerOptions::default();

        let first = compiler.compile(&source, &options).unwrap();
        assert!(!first.from_cache);
        let second = compiler.compile(&source, &options).unwrap();
        assert!(second.from_cache);
        assert_eq!(first.cache_key, second.cache_key);
    }

    #[test]
    fn macros_change_the_key() {
        let source = KernelSource::path_tracer();
        let device = HostDevice::new().info();
        let mut options = CompilerOptions::default();
        let a = cache_key(&source, &options, &device);
        options.set_macro(DIRECT_LIGHT_SAMPLING_STRATEGY, 0);
        let b = cache_key(&source, &options, &device);
        options.set_macro(DIRECT_LIGHT_SAMPLING_STRATEGY, 1);
        let c = cache_key(&source, &options, &device);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_tracks_the_target_device() {
        let source = KernelSource::path_tracer();
        let options = CompilerOptions::default();
        let device = HostDevice::new().info();
        let key = cache_key(&source, &options, &device);
        assert_eq!(key, cache_key(&source, &options, &device.clone()));

        let other_target = DeviceInfo {
            target: "other-target".to_owned(),
            ..device.clone()
        };
        assert_ne!(key, cache_key(&source, &options, &other_target));

        let no_accel = DeviceInfo {
            supports_hardware_acceleration: false,
            ..device
        };
        assert_ne!(key, cache_key(&source, &options, &no_accel));
    }

    #[test]
    fn corrupt_entry_is_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler(dir.path());
        let source = KernelSource::path_tracer();
        let options = CompilerOptions::default();
        let key = compiler.compile(&source, &options).unwrap().cache_key;

        fs::write(dir.path().join(format!("{key}.bin")), b"garbage").unwrap();
        let again = compiler.compile(&source, &options).unwrap();
        assert!(!again.from_cache);
        assert!(compiler.compile(&source, &options).unwrap().from_cache);
    }

    #[test]
    fn invalid_macro_is_a_compilation_error() {
        let compiler = KernelCompiler::new(Arc::new(HostDevice::new()), KernelCache::disabled());
        let mut options = CompilerOptions::default();
        options.set_macro(ENVMAP_SAMPLING_STRATEGY, 42);
        let result = compiler.compile(&KernelSource::path_tracer(), &options);
        assert!(matches!(result, Err(RenderError::KernelCompilation { .. })));
    }

    #[test]
    fn background_compile_joins() {
        let compiler = KernelCompiler::new(Arc::new(HostDevice::new()), KernelCache::disabled());
        let pending = compiler
            .spawn(KernelSource::path_tracer(), CompilerOptions::default())
            .unwrap();
        assert!(pending.join().is_ok());
    }
}
