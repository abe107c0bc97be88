use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    render_system::{
        device::AccelBuildFlags,
        kernel_compiler::KernelCache,
        settings::{RenderSettings, WorldSettings},
    },
};

/// Everything needed to stand up a renderer. Every field has a default so partial files
/// parse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub render: RenderSettings,
    pub world: WorldSettings,
    pub resolution: [u32; 2],
    // defaults to the user cache directory
    pub kernel_cache_dir: Option<PathBuf>,
    pub disable_kernel_cache: bool,
    pub accel_build_flags: AccelBuildFlags,
    // 0 lets the host device use every core
    pub host_worker_threads: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            render: RenderSettings::default(),
            world: WorldSettings::default(),
            resolution: [1280, 720],
            kernel_cache_dir: None,
            disable_kernel_cache: false,
            accel_build_flags: AccelBuildFlags::default(),
            host_worker_threads: 0,
        }
    }
}

impl RendererConfig {
    pub fn from_json_str(json: &str) -> Result<RendererConfig> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<RendererConfig> {
        let text = std::fs::read_to_string(path)?;
        RendererConfig::from_json_str(&text)
    }

    pub fn kernel_cache(&self) -> KernelCache {
        if self.disable_kernel_cache {
            return KernelCache::disabled();
        }
        match self
            .kernel_cache_dir
            .clone()
            .or_else(KernelCache::default_location)
        {
            Some(dir) => KernelCache::new(dir),
            None => KernelCache::disabled(),
        }
    }
}
