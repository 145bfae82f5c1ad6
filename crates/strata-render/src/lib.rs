// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub mod error;
pub mod event;
pub mod frame;
pub mod terrain;
pub mod uniform;

pub use error::RenderError;
pub use event::{render_events, RenderEvent};
pub use frame::{FrameOutcome, FrameStage, FrameSynchronizer, FrameTarget, MAX_FRAMES_IN_FLIGHT};
pub use strata_math::Viewport;
pub use terrain::{Heightmap, TerrainMesh, TerrainSource, TileCorners, TileVertex};
pub use uniform::UniformFrameData;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

pub trait Renderer {
    type Options;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: Self::Options,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Queues a resize; the swapchain is rebuilt at the next frame boundary.
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self, viewport: &Viewport) -> Result<FrameOutcome>;
    fn upload_terrain(&mut self, terrain: &dyn TerrainSource) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
