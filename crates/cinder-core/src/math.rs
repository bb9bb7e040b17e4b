//! Math utilities for culling.

use glam::{Mat4, Vec3, Vec4};

/// Axis-Aligned Bounding Box.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Create a new AABB from min and max corners
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create an AABB from its center and half-extents
    #[inline]
    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    /// Smallest AABB enclosing all points, or `None` for an empty slice.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let mut aabb = Self::new(first, first);
        for point in points {
            aabb.expand_to_include(point);
        }
        Some(aabb)
    }

    /// Get the center of the AABB
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size of the AABB
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Get the half-extents of the AABB
    #[inline]
    pub fn half_extents(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// Expand AABB to include a point
    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Translate the AABB by an offset
    #[inline]
    pub fn translated(&self, offset: Vec3) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }
}

/// Frustum for culling operations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frustum {
    /// Six frustum planes (left, right, bottom, top, near, far).
    ///
    /// Each plane is `(nx, ny, nz, d)` with a unit inward-facing normal, so a
    /// point `p` is inside the half-space when `dot(n, p) + d >= 0`.
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Build a frustum from explicit planes, normalizing each one.
    pub fn from_planes(planes: [Vec4; 6]) -> Self {
        Self {
            planes: planes.map(normalize_plane),
        }
    }

    /// Extract frustum planes from a view-projection matrix.
    ///
    /// Assumes Vulkan clip space: depth in `[0, 1]`, as produced by
    /// [`Mat4::perspective_rh`].
    pub fn from_view_projection(vp: Mat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        Self::from_planes([
            row3 + row0, // Left
            row3 - row0, // Right
            row3 + row1, // Bottom
            row3 - row1, // Top
            row2,        // Near (z >= 0)
            row3 - row2, // Far
        ])
    }

    /// Test a box given as center and half-extents.
    ///
    /// This is the exact test run by the culling compute shader: the box is
    /// rejected only when it lies entirely on the negative side of some plane.
    #[inline]
    pub fn is_box_visible(&self, center: Vec3, extents: Vec3) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            let distance = normal.dot(center) + plane.w;
            let radius = normal.abs().dot(extents);
            distance + radius >= 0.0
        })
    }

    /// Test if an AABB is inside or intersects the frustum
    #[inline]
    pub fn test_aabb(&self, aabb: &Aabb) -> bool {
        self.is_box_visible(aabb.center(), aabb.half_extents())
    }

    /// Planes as plain arrays, ready for a GPU uniform.
    pub fn to_arrays(&self) -> [[f32; 4]; 6] {
        self.planes.map(|plane| plane.to_array())
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> Frustum {
        let view = Mat4::look_to_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        Frustum::from_view_projection(proj * view)
    }

    #[test]
    fn planes_are_normalized() {
        for plane in test_camera().planes {
            assert_relative_eq!(plane.truncate().length(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn near_and_far_planes_match_projection() {
        let frustum = test_camera();
        // Camera looks down -Z, so the near plane faces -Z at distance 0.1.
        let near = frustum.planes[4];
        assert_relative_eq!(near.z, -1.0, epsilon = 1e-4);
        assert_relative_eq!(near.w, -0.1, epsilon = 1e-4);

        let far = frustum.planes[5];
        assert_relative_eq!(far.z, 1.0, epsilon = 1e-4);
        assert_relative_eq!(far.w, 100.0, max_relative = 1e-3);
    }

    #[test]
    fn box_visibility_against_camera() {
        let frustum = test_camera();
        assert!(frustum.is_box_visible(Vec3::new(0.0, 0.0, -10.0), Vec3::ONE));
        // Behind the camera
        assert!(!frustum.is_box_visible(Vec3::new(0.0, 0.0, 10.0), Vec3::ONE));
        // Beyond the far plane
        assert!(!frustum.is_box_visible(Vec3::new(0.0, 0.0, -200.0), Vec3::ONE));
        // Far off to the side
        assert!(!frustum.is_box_visible(Vec3::new(500.0, 0.0, -10.0), Vec3::ONE));
    }

    #[test]
    fn box_straddling_plane_is_visible() {
        let frustum = Frustum::from_planes([
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            Vec4::new(-1.0, 0.0, 0.0, 1.0),
            Vec4::new(0.0, 1.0, 0.0, 1.0),
            Vec4::new(0.0, -1.0, 0.0, 1.0),
            Vec4::new(0.0, 0.0, 1.0, 1.0),
            Vec4::new(0.0, 0.0, -1.0, 1.0),
        ]);
        let aabb = Aabb::from_center_extents(Vec3::new(1.5, 0.0, 0.0), Vec3::splat(0.75));
        assert!(frustum.test_aabb(&aabb));
        let outside = aabb.translated(Vec3::new(1.0, 0.0, 0.0));
        assert!(!frustum.test_aabb(&outside));
    }

    #[test]
    fn aabb_from_points() {
        let aabb = Aabb::from_points([
            Vec3::new(-1.0, 2.0, 0.0),
            Vec3::new(3.0, -2.0, 1.0),
            Vec3::new(0.0, 0.0, -4.0),
        ])
        .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, -4.0));
        assert_eq!(aabb.max, Vec3::new(3.0, 2.0, 1.0));
        assert_relative_eq!(aabb.center().x, 1.0);
        assert_relative_eq!(aabb.half_extents().z, 2.5);
        assert!(Aabb::from_points(std::iter::empty()).is_none());
    }
}
