// SPDX-License-Identifier: CEPL-1.0
use glam::{Mat4, Vec3};

/// Half height of the orthographic volume at zoom level 0, in world units.
pub const BASE_HALF_HEIGHT: f32 = 16.0;
/// Each zoom step shrinks (or grows) the visible half extents by this factor.
pub const ZOOM_STEP: f32 = 1.25;
pub const MIN_ZOOM: i32 = -8;
pub const MAX_ZOOM: i32 = 8;

pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 1000.0;
/// Distance kept between the eye and the point it looks at.
pub const EYE_DISTANCE: f32 = 200.0;

/// Fixed viewing direction: from north-west, above the terrain.
#[inline]
pub fn look_direction() -> Vec3 {
    Vec3::new(1.0, -1.0, 1.0).normalize()
}

#[inline]
pub fn zoom_scale(zoom: i32) -> f32 {
    ZOOM_STEP.powi(-zoom.clamp(MIN_ZOOM, MAX_ZOOM))
}

/// Camera state owned by the viewport collaborator; the renderer only reads it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub eye: Vec3,
    pub zoom: i32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::looking_at(Vec3::ZERO, 0)
    }
}

impl Viewport {
    pub fn looking_at(target: Vec3, zoom: i32) -> Self {
        Self {
            eye: target - look_direction() * EYE_DISTANCE,
            zoom: zoom.clamp(MIN_ZOOM, MAX_ZOOM),
        }
    }

    pub fn target(&self) -> Vec3 {
        self.eye + look_direction() * EYE_DISTANCE
    }

    /// Moves the eye across the ground plane (x east, z south).
    pub fn pan(&mut self, dx: f32, dz: f32) {
        self.eye += Vec3::new(dx, 0.0, dz);
    }

    pub fn zoom_in(&mut self) {
        self.zoom = (self.zoom + 1).min(MAX_ZOOM);
    }

    pub fn zoom_out(&mut self) {
        self.zoom = (self.zoom - 1).max(MIN_ZOOM);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.eye, look_direction(), Vec3::Y)
    }

    /// Orthographic projection for a `width`×`height` target.
    ///
    /// Y is flipped for Vulkan clip space and depth lands in `[0, 1]`.
    pub fn projection(&self, width: u32, height: u32) -> Mat4 {
        let aspect = if height == 0 {
            1.0
        } else {
            width as f32 / height as f32
        };
        let half_h = BASE_HALF_HEIGHT * zoom_scale(self.zoom);
        let half_w = half_h * aspect;
        let mut proj = Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, NEAR_PLANE, FAR_PLANE);
        proj.y_axis.y = -proj.y_axis.y;
        proj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eye_sits_at_view_origin() {
        let vp = Viewport::looking_at(Vec3::new(10.0, 0.0, 5.0), 0);
        let p = vp.view_matrix().transform_point3(vp.eye);
        assert!(p.length() < 1e-3);
        let t = vp.view_matrix().transform_point3(vp.target());
        assert!((t - Vec3::new(0.0, 0.0, -EYE_DISTANCE)).length() < 1e-2);
    }

    #[test]
    fn zoom_in_shrinks_visible_extent() {
        let mut vp = Viewport::default();
        let before = vp.projection(800, 600).x_axis.x;
        vp.zoom_in();
        let after = vp.projection(800, 600).x_axis.x;
        assert!((after / before - ZOOM_STEP).abs() < 1e-4);
    }

    #[test]
    fn aspect_follows_extent() {
        let vp = Viewport::default();
        let p = vp.projection(800, 400);
        // half width is twice the half height
        assert!((p.x_axis.x * 2.0 - p.y_axis.y.abs()).abs() < 1e-6);
        assert!(p.y_axis.y < 0.0);
    }

    #[test]
    fn zero_height_extent_is_finite() {
        let p = Viewport::default().projection(0, 0);
        assert!(p.is_finite());
    }

    #[test]
    fn zoom_is_clamped() {
        let mut vp = Viewport::looking_at(Vec3::ZERO, 100);
        assert_eq!(vp.zoom, MAX_ZOOM);
        for _ in 0..40 {
            vp.zoom_out();
        }
        assert_eq!(vp.zoom, MIN_ZOOM);
    }
}
