use bytemuck::{Pod, Zeroable};
use nalgebra::{Isometry3, Matrix4, Perspective3, Point3, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};

// keeps the free-fly camera from flipping over the poles
const MAX_PITCH_DEGREES: f32 = 89.0;

#[inline]
fn deg2rad(deg: f32) -> f32 {
    deg * std::f32::consts::PI / 180.0
}

/// Pinhole camera. Looks down its local -Z axis with +Y up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub translation: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    // radians
    pub vertical_fov: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    pub aspect: f32,
}

impl Default for Camera {
    fn default() -> Camera {
        Camera {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            vertical_fov: deg2rad(45.0),
            near_plane: 0.01,
            far_plane: 1000.0,
            aspect: 1.0,
        }
    }
}

/// Camera in the form the kernel consumes. Matrices are column major.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceCamera {
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    pub position: [f32; 3],
    pub _pad: f32,
}

impl Camera {
    pub fn look_at(
        eye: Point3<f32>,
        target: Point3<f32>,
        up: Vector3<f32>,
        vertical_fov: f32,
    ) -> Camera {
        let view = Isometry3::look_at_rh(&eye, &target, &up);
        Camera {
            translation: eye.coords,
            rotation: view.rotation.inverse(),
            vertical_fov,
            ..Default::default()
        }
    }

    pub fn set_resolution(&mut self, width: u32, height: u32) {
        self.aspect = width.max(1) as f32 / height.max(1) as f32;
    }

    pub fn pose(&self) -> Isometry3<f32> {
        Isometry3::from_parts(self.translation.into(), self.rotation)
    }

    pub fn projection(&self) -> Perspective3<f32> {
        Perspective3::new(self.aspect, self.vertical_fov, self.near_plane, self.far_plane)
    }

    pub fn forward(&self) -> Vector3<f32> {
        self.rotation * -Vector3::z()
    }

    pub fn to_device(&self) -> DeviceCamera {
        let inverse_view: Matrix4<f32> = self.pose().to_homogeneous();
        let inverse_projection = self.projection().inverse();
        DeviceCamera {
            inverse_view: inverse_view.into(),
            inverse_projection: inverse_projection.into(),
            position: self.translation.into(),
            _pad: 0.0,
        }
    }

    /// Moves the camera in its local frame.
    pub fn translate(&mut self, local_offset: Vector3<f32>) {
        self.translation += self.rotation * local_offset;
    }

    /// Yaw around world up, pitch around the camera's right axis.
    pub fn rotate(&mut self, yaw: f32, pitch: f32) {
        let forward = self.forward();
        let current_pitch = forward.y.clamp(-1.0, 1.0).asin();
        let max_pitch = deg2rad(MAX_PITCH_DEGREES);
        let pitch = (current_pitch + pitch).clamp(-max_pitch, max_pitch) - current_pitch;

        let yaw_rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw);
        let pitch_rotation = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), pitch);
        self.rotation = yaw_rotation * self.rotation * pitch_rotation;
    }

    pub fn zoom(&mut self, amount: f32) {
        self.translate(Vector3::new(0.0, 0.0, -amount));
    }

    pub fn apply_motion(&mut self, motion: CameraMotion) {
        match motion {
            CameraMotion::Rotate { yaw, pitch } => self.rotate(yaw, pitch),
            CameraMotion::Pan(delta) => self.translate(Vector3::new(delta.x, delta.y, 0.0)),
            CameraMotion::Zoom(amount) => self.zoom(amount),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CameraMotion {
    Rotate { yaw: f32, pitch: f32 },
    Pan(Vector2<f32>),
    Zoom(f32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerButton {
    Left,
    Middle,
    Right,
}

/// Turns pointer input into camera motion. Implementations are chosen when the input layer
/// is put together.
pub trait ViewInteractor {
    /// True while a drag is in progress; the renderer drops to low resolution meanwhile.
    fn is_interacting(&self) -> bool;

    fn button_changed(&mut self, button: PointerButton, pressed: bool);

    /// `delta` is normalized by the window size, see `utils::normalized_pointer_delta`.
    fn pointer_delta(&mut self, delta: Vector2<f32>) -> Option<CameraMotion>;

    fn scrolled(&mut self, lines: f32) -> Option<CameraMotion> {
        Some(CameraMotion::Zoom(lines * 0.25))
    }
}

/// Middle-drag rotates the view.
#[derive(Clone, Debug)]
pub struct OrbitInteractor {
    pub sensitivity: f32,
    dragging: bool,
}

impl Default for OrbitInteractor {
    fn default() -> OrbitInteractor {
        OrbitInteractor {
            sensitivity: 2.0,
            dragging: false,
        }
    }
}

impl ViewInteractor for OrbitInteractor {
    fn is_interacting(&self) -> bool {
        self.dragging
    }

    fn button_changed(&mut self, button: PointerButton, pressed: bool) {
        if button == PointerButton::Middle {
            self.dragging = pressed;
        }
    }

    fn pointer_delta(&mut self, delta: Vector2<f32>) -> Option<CameraMotion> {
        self.dragging.then(|| CameraMotion::Rotate {
            yaw: -delta.x * self.sensitivity,
            pitch: -delta.y * self.sensitivity,
        })
    }
}

/// Left-drag looks around, right-drag pans.
#[derive(Clone, Debug)]
pub struct FreeFlyInteractor {
    pub look_sensitivity: f32,
    pub pan_speed: f32,
    looking: bool,
    panning: bool,
}

impl Default for FreeFlyInteractor {
    fn default() -> FreeFlyInteractor {
        FreeFlyInteractor {
            look_sensitivity: 1.5,
            pan_speed: 2.0,
            looking: false,
            panning: false,
        }
    }
}

impl ViewInteractor for FreeFlyInteractor {
    fn is_interacting(&self) -> bool {
        self.looking || self.panning
    }

    fn button_changed(&mut self, button: PointerButton, pressed: bool) {
        match button {
            PointerButton::Left => self.looking = pressed,
            PointerButton::Right => self.panning = pressed,
            PointerButton::Middle => {}
        }
    }

    fn pointer_delta(&mut self, delta: Vector2<f32>) -> Option<CameraMotion> {
        if self.looking {
            Some(CameraMotion::Rotate {
                yaw: -delta.x * self.look_sensitivity,
                pitch: -delta.y * self.look_sensitivity,
            })
        } else if self.panning {
            // screen y grows downwards
            Some(CameraMotion::Pan(Vector2::new(-delta.x, delta.y) * self.pan_speed))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Vector3<f32>, b: Vector3<f32>) {
        assert!((a - b).norm() < 1e-5, "{a:?} != {b:?}");
    }

    #[test]
    fn look_at_faces_target() {
        let camera = Camera::look_at(
            Point3::new(0.0, 1.0, 5.0),
            Point3::new(0.0, 1.0, 0.0),
            Vector3::y(),
            deg2rad(40.0),
        );
        assert_close(camera.forward(), -Vector3::z());

        let camera = Camera::look_at(
            Point3::new(0.0, 3.0, 0.0),
            Point3::origin(),
            Vector3::z(),
            deg2rad(40.0),
        );
        assert_close(camera.forward(), -Vector3::y());
    }

    #[test]
    fn resize_preserves_aspect() {
        let mut camera = Camera::default();
        camera.set_resolution(1920, 1080);
        assert!((camera.aspect - 16.0 / 9.0).abs() < 1e-6);
        // projection must still invert cleanly
        let device = camera.to_device();
        let inv = Matrix4::from(device.inverse_projection);
        let roundtrip = camera.projection().to_homogeneous() * inv;
        assert!((roundtrip - Matrix4::identity()).norm() < 1e-3);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.rotate(0.0, deg2rad(120.0));
        let pitch = camera.forward().y.asin();
        assert!(pitch <= deg2rad(MAX_PITCH_DEGREES) + 1e-4);
    }

    #[test]
    fn orbit_only_moves_while_dragging() {
        let mut interactor = OrbitInteractor::default();
        assert_eq!(interactor.pointer_delta(Vector2::new(0.1, 0.0)), None);
        interactor.button_changed(PointerButton::Middle, true);
        assert!(interactor.is_interacting());
        assert!(matches!(
            interactor.pointer_delta(Vector2::new(0.1, 0.0)),
            Some(CameraMotion::Rotate { .. })
        ));
        interactor.button_changed(PointerButton::Middle, false);
        assert!(!interactor.is_interacting());
    }

    #[test]
    fn free_fly_pans_with_right_button() {
        let mut interactor = FreeFlyInteractor::default();
        interactor.button_changed(PointerButton::Right, true);
        let motion = interactor.pointer_delta(Vector2::new(0.5, 0.0));
        assert_eq!(motion, Some(CameraMotion::Pan(Vector2::new(-1.0, 0.0))));

        let mut camera = Camera::default();
        camera.apply_motion(motion.unwrap());
        assert_close(camera.translation, Vector3::new(-1.0, 0.0, 0.0));
    }
}
