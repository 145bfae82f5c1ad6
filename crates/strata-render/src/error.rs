// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;
use std::time::Duration;

/// Fatal renderer failures that callers may want to tell apart.
///
/// Stale or suboptimal swapchains never show up here: they are repaired by a
/// rebuild inside the frame loop.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("no physical device satisfies the renderer's requirements")]
    NoSuitableDevice,
    #[error("no depth/stencil attachment format is supported with optimal tiling")]
    NoDepthFormat,
    #[error("no memory type matches bits {type_bits:#x} with properties {properties}")]
    NoMemoryType { type_bits: u32, properties: String },
    #[error("shader asset not found: {}", path.display())]
    MissingShader { path: PathBuf },
    #[error("GPU did not signal the {what} within {timeout:?}")]
    GpuTimeout { what: &'static str, timeout: Duration },
    #[error("device lost during {0}")]
    DeviceLost(&'static str),
    #[error("terrain of {tiles} tiles does not fit 32-bit indices")]
    TerrainTooLarge { tiles: u64 },
    #[error("{op} failed: {detail}")]
    Vulkan { op: &'static str, detail: String },
}
