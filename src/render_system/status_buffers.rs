use crate::render_system::device::{Backend, DeviceBuffer, DeviceError};

/// What the kernel reported about the last frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStatus {
    // false once every pixel has stopped sampling
    pub still_one_ray_active: bool,
    pub pixel_converged_count: u32,
    pub invalid_sample_count: u32,
}

/// Single-element counters written by the kernel with atomic adds.
pub struct StatusBuffers<B: Backend> {
    still_one_ray_active: B::Buffer<u32>,
    pixel_converged_count: B::Buffer<u32>,
    invalid_sample_count: B::Buffer<u32>,
}

impl<B: Backend> StatusBuffers<B> {
    pub fn new(device: &B) -> Result<StatusBuffers<B>, DeviceError> {
        Ok(StatusBuffers {
            still_one_ray_active: device.alloc(1)?,
            pixel_converged_count: device.alloc(1)?,
            invalid_sample_count: device.alloc(1)?,
        })
    }

    pub fn clear(&self) -> Result<(), DeviceError> {
        self.still_one_ray_active.fill(0)?;
        self.pixel_converged_count.fill(0)?;
        self.invalid_sample_count.fill(0)
    }

    pub fn read_back(&self) -> Result<RenderStatus, DeviceError> {
        let first = |buffer: &B::Buffer<u32>| -> Result<u32, DeviceError> {
            Ok(buffer.read()?.first().copied().unwrap_or(0))
        };
        Ok(RenderStatus {
            still_one_ray_active: first(&self.still_one_ray_active)? != 0,
            pixel_converged_count: first(&self.pixel_converged_count)?,
            invalid_sample_count: first(&self.invalid_sample_count)?,
        })
    }

    pub fn bindings(&self) -> StatusBindings<B> {
        StatusBindings {
            still_one_ray_active: self.still_one_ray_active.binding(),
            pixel_converged_count: self.pixel_converged_count.binding(),
            invalid_sample_count: self.invalid_sample_count.binding(),
        }
    }
}

pub struct StatusBindings<B: Backend> {
    pub still_one_ray_active: B::Binding<u32>,
    pub pixel_converged_count: B::Binding<u32>,
    pub invalid_sample_count: B::Binding<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_system::device::host::HostDevice;

    #[test]
    fn clear_resets_every_counter() {
        let device = HostDevice::new();
        let status = StatusBuffers::new(&device).unwrap();
        status.still_one_ray_active.write(&[1]).unwrap();
        status.pixel_converged_count.write(&[12]).unwrap();
        status.invalid_sample_count.write(&[3]).unwrap();
        assert_eq!(
            status.read_back().unwrap(),
            RenderStatus {
                still_one_ray_active: true,
                pixel_converged_count: 12,
                invalid_sample_count: 3,
            }
        );
        status.clear().unwrap();
        assert_eq!(status.read_back().unwrap(), RenderStatus::default());
    }
}
