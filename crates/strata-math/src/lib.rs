// SPDX-License-Identifier: CEPL-1.0
//! Small math layer shared by the terrain builder and the renderers.

pub use glam;
pub use glam::{Mat4, Vec3};

mod camera;

pub use camera::{
    look_direction, zoom_scale, Viewport, BASE_HALF_HEIGHT, EYE_DISTANCE, FAR_PLANE, MAX_ZOOM,
    MIN_ZOOM, NEAR_PLANE, ZOOM_STEP,
};

/// Face normal of triangle `(a, b, c)` following `(b - a) × (c - a)`.
///
/// Degenerate triangles yield NaN components; callers decide how to repair them.
#[inline]
pub fn face_normal(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    (b - a).cross(c - a).normalize()
}
