//! Camera and directional light
//!
//! Both are owned by the scene. The render manager only holds `Weak`
//! references and renders with its own default camera and light once
//! they are gone.

use glam::{Mat4, Quat, Vec3};

/// Left-handed perspective camera
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    position: Vec3,
    rotation: Quat,
    fov_y: f32,
    aspect_ratio: f32,
    near_clip: f32,
    far_clip: f32,
    view: Mat4,
    projection: Mat4,
    view_projection: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        let mut camera = Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            fov_y: 45.0_f32.to_radians(),
            aspect_ratio: 16.0 / 9.0,
            near_clip: 0.1,
            far_clip: 1000.0,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            view_projection: Mat4::IDENTITY,
        };
        camera.update_matrices();
        camera
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation.normalize();
    }

    /// Orient the camera along `direction` with +Y up
    pub fn look_to(&mut self, direction: Vec3) {
        let forward = direction.normalize_or_zero();
        if forward == Vec3::ZERO {
            return;
        }
        self.rotation = Quat::from_rotation_arc(Vec3::Z, forward);
    }

    pub fn set_perspective(&mut self, fov_y: f32, aspect_ratio: f32, near_clip: f32, far_clip: f32) {
        self.fov_y = fov_y;
        self.aspect_ratio = aspect_ratio;
        self.near_clip = near_clip;
        self.far_clip = far_clip;
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        self.aspect_ratio = aspect_ratio;
    }

    /// Recompute view, projection and their product
    pub fn update_matrices(&mut self) {
        let forward = self.rotation * Vec3::Z;
        let up = self.rotation * Vec3::Y;
        self.view = Mat4::look_to_lh(self.position, forward, up);
        self.projection =
            Mat4::perspective_lh(self.fov_y, self.aspect_ratio, self.near_clip, self.far_clip);
        self.view_projection = self.projection * self.view;
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    pub fn near_clip(&self) -> f32 {
        self.near_clip
    }

    pub fn far_clip(&self) -> f32 {
        self.far_clip
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view_projection(&self) -> Mat4 {
        self.view_projection
    }
}

/// Sun light
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(0.0, -1.0, 0.0),
            color: Vec3::ONE,
            intensity: 1.0,
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_in_front_projects_into_clip_volume() {
        let mut camera = Camera::new();
        camera.set_position(Vec3::new(0.0, 1.0, -5.0));
        camera.look_to(Vec3::new(0.0, -1.0, 5.0));
        camera.update_matrices();

        let clip = camera.view_projection() * Vec3::ZERO.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(clip.w > 0.0);
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn test_point_behind_camera_has_negative_w() {
        let mut camera = Camera::new();
        camera.set_position(Vec3::new(0.0, 0.0, 0.0));
        camera.update_matrices();

        let clip = camera.view_projection() * Vec3::new(0.0, 0.0, -10.0).extend(1.0);
        assert!(clip.w < 0.0);
    }

    #[test]
    fn test_light_direction_is_normalized() {
        let light = DirectionalLight::new(Vec3::new(1.0, -1.0, 1.0), Vec3::ONE, 2.0);
        assert!((light.direction.length() - 1.0).abs() < 1e-5);
    }
}
