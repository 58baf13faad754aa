//! Camera system

use glam::{Mat4, Vec3};

/// A fly camera oriented by yaw and pitch
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    /// Rotation around +Y in radians, 0 looks down -Z.
    pub yaw: f32,
    /// Rotation above the horizon in radians.
    pub pitch: f32,
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 1.0, 5.0),
            yaw: 0.0,
            pitch: 0.0,
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32) -> Self {
        Self {
            position,
            yaw,
            pitch,
            ..Self::default()
        }
    }

    /// Get the forward direction
    pub fn forward(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(-sin_yaw * cos_pitch, sin_pitch, -cos_yaw * cos_pitch).normalize()
    }

    /// Get the right direction
    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize()
    }

    pub fn rotate(&mut self, delta_yaw: f32, delta_pitch: f32) {
        let limit = std::f32::consts::FRAC_PI_2 - 0.01;
        self.yaw += delta_yaw;
        self.pitch = (self.pitch + delta_pitch).clamp(-limit, limit);
    }

    /// Get the view matrix
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    /// Get the projection matrix, depth `0..1` with Y pointing down in clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Get combined view-projection matrix
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Update aspect ratio for perspective projection
    pub fn set_aspect(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_looks_down_negative_z() {
        let camera = Camera::default();
        assert!((camera.forward() - Vec3::NEG_Z).length() < 1e-6);
        assert!((camera.right() - Vec3::X).length() < 1e-6);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.rotate(0.0, 10.0);
        assert!(camera.pitch < std::f32::consts::FRAC_PI_2);
        assert!(camera.forward().y > 0.99);
    }

    #[test]
    fn test_point_ahead_projects_inside_clip_volume() {
        let camera = Camera::new(Vec3::ZERO, 0.0, 0.0);
        let clip = camera.view_projection_matrix() * Vec3::new(0.0, 0.5, -10.0).extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
        // above the horizon maps to the upper half, which is negative Y in Vulkan
        assert!(ndc.y < 0.0);
    }

    #[test]
    fn test_set_aspect_ignores_zero_height() {
        let mut camera = Camera::default();
        camera.set_aspect(800, 0);
        assert_eq!(camera.aspect, 16.0 / 9.0);
        camera.set_aspect(800, 400);
        assert_eq!(camera.aspect, 2.0);
    }
}
