use std::path::PathBuf;

use thiserror::Error;

use crate::render_system::device::DeviceError;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("failed to compile kernel '{name}': {message}")]
    KernelCompilation { name: String, message: String },

    #[error("acceleration structure build failed: {0}")]
    AccelerationStructure(String),

    #[error("invalid scene: {0}")]
    InvalidScene(String),

    #[error("a frame is already in flight on the compute stream")]
    FrameInFlight,

    #[error("no kernel program is available")]
    NoProgram,

    #[error("no scene has been uploaded")]
    NoScene,

    #[error("failed to decode texture {path}: {source}")]
    TextureDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("texture loader thread panicked")]
    TextureLoaderPanicked,

    #[error("kernel compiler thread panicked")]
    CompilerPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}
