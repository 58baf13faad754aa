//! View frustum planes.
//!
//! Planes are extracted from the combined projection-view matrix by adding
//! and subtracting its rows (Gribb and Hartmann), assuming Vulkan clip space
//! with depth in `0..1`. Each plane stores its normal in `xyz` and its
//! distance in `w`, with the normal pointing into the frustum.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrustumSide {
    Left = 0,
    Right = 1,
    Bottom = 2,
    Top = 3,
    Near = 4,
    Far = 5,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Frustum {
    pub planes: [Vec4; 6],
}

impl Default for Frustum {
    fn default() -> Self {
        Self::from_matrix(Mat4::IDENTITY)
    }
}

impl Frustum {
    /// Extract the six planes of `view_proj` (projection * view).
    pub fn from_matrix(view_proj: Mat4) -> Self {
        let r0 = view_proj.row(0);
        let r1 = view_proj.row(1);
        let r2 = view_proj.row(2);
        let r3 = view_proj.row(3);

        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(normalize_plane);
        Self { planes }
    }

    pub fn plane(&self, side: FrustumSide) -> Vec4 {
        self.planes[side as usize]
    }

    /// Signed distance of `point` from a plane; positive is inside.
    pub fn distance(&self, side: FrustumSide, point: Vec3) -> f32 {
        let plane = self.plane(side);
        plane.truncate().dot(point) + plane.w
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(point) + plane.w >= 0.0)
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.truncate().length();
    if length > f32::EPSILON {
        plane / length
    } else {
        plane
    }
}
