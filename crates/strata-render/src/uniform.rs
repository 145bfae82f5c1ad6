// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use strata_math::{Mat4, Viewport};

/// Camera block bound at set 0, binding 0 of the vertex stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct UniformFrameData {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
}

impl Default for UniformFrameData {
    fn default() -> Self {
        let identity = Mat4::IDENTITY.to_cols_array_2d();
        Self {
            model: identity,
            view: identity,
            proj: identity,
        }
    }
}

impl UniformFrameData {
    pub fn for_viewport(viewport: &Viewport, width: u32, height: u32) -> Self {
        Self {
            model: Mat4::IDENTITY.to_cols_array_2d(),
            view: viewport.view_matrix().to_cols_array_2d(),
            proj: viewport.projection(width, height).to_cols_array_2d(),
        }
    }
}
