//! Camera and view management.

use cinder_core::Frustum;
use glam::{Mat4, Vec3};

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3, fov: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            up: Vec3::Y,
            fov,
            aspect,
            near,
            far,
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    /// Rotate around the world up axis through `pivot`, keeping the distance.
    pub fn orbit(&mut self, pivot: Vec3, angle: f32) {
        let offset = glam::Quat::from_rotation_y(angle) * (self.position - pivot);
        self.position = pivot + offset;
        self.look_at(pivot);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Vulkan projection: depth in `[0, 1]` and Y pointing down in clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// The six culling planes of the current view.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn frustum_contains_what_the_camera_sees() {
        let camera = Camera::default();
        let frustum = camera.frustum();

        assert!(frustum.is_box_visible(Vec3::ZERO, Vec3::splat(0.5)));
        // behind the camera
        assert!(!frustum.is_box_visible(Vec3::new(0.0, 0.0, 20.0), Vec3::splat(0.5)));
        // far off to the side
        assert!(!frustum.is_box_visible(Vec3::new(100.0, 0.0, 0.0), Vec3::splat(0.5)));
    }

    #[test]
    fn y_flip_keeps_culling_symmetric() {
        let camera = Camera::default();
        let frustum = camera.frustum();
        let above = frustum.is_box_visible(Vec3::new(0.0, 3.0, 0.0), Vec3::splat(0.1));
        let below = frustum.is_box_visible(Vec3::new(0.0, -3.0, 0.0), Vec3::splat(0.1));
        assert_eq!(above, below);
    }

    #[test]
    fn orbit_keeps_distance() {
        let mut camera = Camera::default();
        camera.orbit(Vec3::ZERO, std::f32::consts::FRAC_PI_2);
        assert_relative_eq!(camera.position.length(), 5.0, epsilon = 1e-4);
        assert_relative_eq!(camera.position.x, 5.0, epsilon = 1e-4);
        assert_relative_eq!(camera.direction.x, -1.0, epsilon = 1e-4);
    }
}
