use std::sync::Arc;

use tracing::debug;

use crate::render_system::device::{Backend, DeviceBuffer, DeviceError};

/// Per-pixel statistics read by adaptive sampling and the noise stop.
pub struct AdaptiveSamplingBuffers<B: Backend> {
    pub sample_counts: B::Buffer<u32>,
    pub squared_luminance: B::Buffer<f32>,
}

/// Accumulation targets of the progressive renderer, all `width * height` long.
pub struct FrameBuffers<B: Backend> {
    device: Arc<B>,
    resolution: [u32; 2],
    // sum of every sample taken so far; divide by the sample number to display
    pub color: B::Buffer<[f32; 3]>,
    pub denoiser_normals: B::Buffer<[f32; 3]>,
    pub denoiser_albedo: B::Buffer<[f32; 3]>,
    pub adaptive: Option<AdaptiveSamplingBuffers<B>>,
}

fn pixel_count(resolution: [u32; 2]) -> usize {
    resolution[0] as usize * resolution[1] as usize
}

impl<B: Backend> FrameBuffers<B> {
    pub fn new(
        device: Arc<B>,
        resolution: [u32; 2],
        with_adaptive: bool,
    ) -> Result<FrameBuffers<B>, DeviceError> {
        let pixels = pixel_count(resolution);
        let adaptive = if with_adaptive {
            Some(Self::alloc_adaptive(&device, pixels)?)
        } else {
            None
        };
        Ok(FrameBuffers {
            color: device.alloc(pixels)?,
            denoiser_normals: device.alloc(pixels)?,
            denoiser_albedo: device.alloc(pixels)?,
            adaptive,
            resolution,
            device,
        })
    }

    fn alloc_adaptive(device: &B, pixels: usize) -> Result<AdaptiveSamplingBuffers<B>, DeviceError> {
        Ok(AdaptiveSamplingBuffers {
            sample_counts: device.alloc(pixels)?,
            squared_luminance: device.alloc(pixels)?,
        })
    }

    pub fn resolution(&self) -> [u32; 2] {
        self.resolution
    }

    /// Reallocates every buffer. The caller guarantees no launch references them.
    pub fn resize(&mut self, resolution: [u32; 2]) -> Result<(), DeviceError> {
        if resolution == self.resolution {
            return Ok(());
        }
        let with_adaptive = self.adaptive.is_some();
        *self = FrameBuffers::new(self.device.clone(), resolution, with_adaptive)?;
        debug!(width = resolution[0], height = resolution[1], "resized frame buffers");
        Ok(())
    }

    /// Allocates or releases the adaptive buffers. Returns true when anything changed, in
    /// which case the accumulation must restart.
    pub fn ensure_adaptive(&mut self, wanted: bool) -> Result<bool, DeviceError> {
        match (wanted, self.adaptive.is_some()) {
            (true, false) => {
                self.adaptive = Some(Self::alloc_adaptive(&self.device, pixel_count(self.resolution))?);
                debug!("allocated adaptive sampling buffers");
                Ok(true)
            }
            (false, true) => {
                self.adaptive = None;
                debug!("released adaptive sampling buffers");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn bindings(&self) -> FrameBindings<B> {
        FrameBindings {
            color: self.color.binding(),
            denoiser_normals: self.denoiser_normals.binding(),
            denoiser_albedo: self.denoiser_albedo.binding(),
            sample_counts: self.adaptive.as_ref().map(|a| a.sample_counts.binding()),
            squared_luminance: self.adaptive.as_ref().map(|a| a.squared_luminance.binding()),
        }
    }
}

pub struct FrameBindings<B: Backend> {
    pub color: B::Binding<[f32; 3]>,
    pub denoiser_normals: B::Binding<[f32; 3]>,
    pub denoiser_albedo: B::Binding<[f32; 3]>,
    pub sample_counts: Option<B::Binding<u32>>,
    pub squared_luminance: Option<B::Binding<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_system::device::host::{HostDevice, MemoryEvent};

    #[test]
    fn adaptive_buffers_are_allocated_on_demand() {
        let device = Arc::new(HostDevice::new());
        let mut buffers = FrameBuffers::new(device, [4, 3], false).unwrap();
        assert_eq!(buffers.color.len(), 12);
        assert!(buffers.bindings().sample_counts.is_none());

        assert!(buffers.ensure_adaptive(true).unwrap());
        assert!(!buffers.ensure_adaptive(true).unwrap());
        assert_eq!(buffers.adaptive.as_ref().unwrap().sample_counts.len(), 12);
        assert!(buffers.bindings().squared_luminance.is_some());

        assert!(buffers.ensure_adaptive(false).unwrap());
        assert!(buffers.adaptive.is_none());
    }

    #[test]
    fn resize_reallocates_everything() {
        let device = Arc::new(HostDevice::new());
        let mut buffers = FrameBuffers::new(device.clone(), [2, 2], true).unwrap();
        buffers.color.fill([1.0; 3]).unwrap();
        device.clear_memory_events();

        buffers.resize([3, 5]).unwrap();
        assert_eq!(buffers.resolution(), [3, 5]);
        assert_eq!(buffers.denoiser_albedo.len(), 15);
        assert_eq!(buffers.adaptive.as_ref().unwrap().squared_luminance.len(), 15);
        assert!(buffers.color.read().unwrap().iter().all(|c| *c == [0.0; 3]));

        let frees = device
            .memory_events()
            .into_iter()
            .filter(|e| matches!(e, MemoryEvent::Free { .. }))
            .count();
        assert_eq!(frees, 5);
    }
}
