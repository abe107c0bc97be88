use std::f32::consts::PI;

use image::Rgba32FImage;
use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::{
    render_system::{
        device::{Backend, DeviceError},
        kernel::rng::Xorshift32,
        scene::TextureImage,
    },
    utils::luminance,
};

/// Equirectangular mapping; +Y is up and v = 0 is the zenith.
pub fn direction_to_uv(direction: &Vector3<f32>) -> [f32; 2] {
    let u = 0.5 + direction.z.atan2(direction.x) / (2.0 * PI);
    let v = direction.y.clamp(-1.0, 1.0).acos() / PI;
    [u, v]
}

pub fn uv_to_direction(uv: [f32; 2]) -> Vector3<f32> {
    let phi = (uv[0] - 0.5) * 2.0 * PI;
    let theta = uv[1] * PI;
    let sin_theta = theta.sin();
    Vector3::new(sin_theta * phi.cos(), theta.cos(), sin_theta * phi.sin())
}

/// Running sum over texels of luminance weighted by the solid angle of their row.
pub fn build_cdf(image: &Rgba32FImage) -> Vec<f32> {
    let height = image.height();
    let mut total = 0.0_f64;
    image
        .enumerate_pixels()
        .map(|(_, y, pixel)| {
            let theta = (y as f32 + 0.5) / height as f32 * PI;
            let [r, g, b, _] = pixel.0;
            let weight = luminance(&Vector3::new(r, g, b)).max(0.0) * theta.sin();
            total += weight as f64;
            total as f32
        })
        .collect()
}

/// Host-side environment image and its sampling distribution.
pub struct EnvironmentMap {
    pub image: TextureImage,
    pub cdf: Vec<f32>,
}

impl EnvironmentMap {
    /// `None` for an empty image; callers fall back to uniform lighting.
    pub fn new(image: Rgba32FImage) -> Option<EnvironmentMap> {
        if image.width() == 0 || image.height() == 0 {
            warn!("environment map is empty");
            return None;
        }
        let cdf = build_cdf(&image);
        debug!(
            width = image.width(),
            height = image.height(),
            total_weight = cdf.last().copied().unwrap_or(0.0),
            "built environment CDF"
        );
        Some(EnvironmentMap {
            image: TextureImage::Hdr(image),
            cdf,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Environment resources resident on a device.
pub struct DeviceEnvironment<B: Backend> {
    pub texture: B::Texture,
    pub cdf: B::Buffer<f32>,
    pub width: u32,
    pub height: u32,
}

impl<B: Backend> DeviceEnvironment<B> {
    pub fn upload(device: &B, map: &EnvironmentMap) -> Result<DeviceEnvironment<B>, DeviceError> {
        Ok(DeviceEnvironment {
            texture: device.upload_texture(&map.image)?,
            cdf: device.upload(&map.cdf)?,
            width: map.width(),
            height: map.height(),
        })
    }

    pub fn bindings(&self) -> EnvironmentBindings<B> {
        use crate::render_system::device::DeviceBuffer;
        EnvironmentBindings {
            texture: self.texture.clone(),
            cdf: self.cdf.binding(),
            width: self.width,
            height: self.height,
        }
    }
}

pub struct EnvironmentBindings<B: Backend> {
    pub texture: B::Texture,
    pub cdf: B::Binding<f32>,
    pub width: u32,
    pub height: u32,
}

impl<B: Backend> Clone for EnvironmentBindings<B> {
    fn clone(&self) -> Self {
        EnvironmentBindings {
            texture: self.texture.clone(),
            cdf: self.cdf.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

/// Read-only view used while tracing.
#[derive(Clone, Copy)]
pub struct EnvironmentData<'a> {
    pub image: &'a TextureImage,
    pub cdf: &'a [f32],
}

impl EnvironmentData<'_> {
    pub fn lookup(&self, direction: &Vector3<f32>) -> Vector3<f32> {
        self.image.sample(direction_to_uv(direction)).xyz()
    }

    /// Importance sampled direction with its solid angle pdf.
    pub fn sample(&self, rng: &mut Xorshift32) -> Option<(Vector3<f32>, f32)> {
        let total = *self.cdf.last()?;
        if total <= 0.0 {
            return None;
        }
        let target = rng.next_f32() * total;
        let idx = self
            .cdf
            .partition_point(|&c| c <= target)
            .min(self.cdf.len() - 1);
        let weight = self.cdf[idx] - if idx == 0 { 0.0 } else { self.cdf[idx - 1] };

        let width = self.image.width();
        let height = self.image.height();
        let x = idx as u32 % width;
        let y = idx as u32 / width;
        let uv = [
            (x as f32 + rng.next_f32()) / width as f32,
            (y as f32 + rng.next_f32()) / height as f32,
        ];
        let sin_theta = (uv[1] * PI).sin();
        if sin_theta <= 0.0 || weight <= 0.0 {
            return None;
        }
        let pdf_uv = weight / total * (width * height) as f32;
        Some((uv_to_direction(uv), pdf_uv / (2.0 * PI * PI * sin_theta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn uv_mapping_round_trips() {
        for d in [
            Vector3::new(0.3, 0.5, -0.2),
            Vector3::new(-0.9, -0.1, 0.4),
            Vector3::new(0.0, 0.2, 1.0),
        ] {
            let d = d.normalize();
            let back = uv_to_direction(direction_to_uv(&d));
            assert!((back - d).norm() < 1e-5, "{d:?} -> {back:?}");
        }
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(EnvironmentMap::new(Rgba32FImage::new(0, 0)).is_none());
    }

    #[test]
    fn sampling_prefers_bright_texels() {
        let mut image = Rgba32FImage::from_pixel(8, 4, Rgba([0.01, 0.01, 0.01, 1.0]));
        image.put_pixel(2, 1, Rgba([100.0, 100.0, 100.0, 1.0]));
        let map = EnvironmentMap::new(image).unwrap();
        let data = EnvironmentData {
            image: &map.image,
            cdf: &map.cdf,
        };
        let mut rng = Xorshift32::new(1);
        let bright = data.lookup(&uv_to_direction([2.5 / 8.0, 1.5 / 4.0]));
        assert!(bright.x > 50.0);

        let mut hits = 0;
        for _ in 0..1000 {
            let (dir, pdf) = data.sample(&mut rng).unwrap();
            assert!(pdf > 0.0);
            if data.lookup(&dir).x > 50.0 {
                hits += 1;
            }
        }
        assert!(hits > 900);
    }

    #[test]
    fn constant_environment_pdf_integrates_to_one() {
        let map = EnvironmentMap::new(Rgba32FImage::from_pixel(16, 8, Rgba([1.0; 4]))).unwrap();
        let data = EnvironmentData {
            image: &map.image,
            cdf: &map.cdf,
        };
        // E[1 / pdf] over the sampled distribution is the measure of the sphere
        let mut rng = Xorshift32::new(9);
        let n = 20_000;
        let sum: f64 = (0..n)
            .filter_map(|_| data.sample(&mut rng))
            .map(|(_, pdf)| 1.0 / pdf as f64)
            .sum();
        let sphere = sum / n as f64;
        assert!((sphere - 4.0 * std::f64::consts::PI).abs() < 0.5, "{sphere}");
    }
}
