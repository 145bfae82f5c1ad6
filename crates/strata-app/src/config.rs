// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use strata_render_vk::{ShaderSource, VkRendererOptions, VsyncMode};
use tracing::{info, warn};

pub const DEFAULT_CONFIG: &str = "strata.toml";

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct AppCfg {
    pub render: RenderCfg,
    pub terrain: TerrainCfg,
    pub camera: CameraCfg,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync_mode: VsyncModeCfg,
    pub validation: bool,
    pub fence_timeout_ms: u64,
    pub shader_dir: Option<PathBuf>,
    pub show_grid: bool,
    pub pipeline_cache: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct TerrainCfg {
    pub width: u32,
    pub height: u32,
    /// Peak corner elevation in height steps.
    pub amplitude: i8,
    pub seed: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct CameraCfg {
    pub zoom: i32,
    /// World units moved per key press.
    pub pan_step: f32,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            vsync_mode: VsyncModeCfg::Mailbox,
            validation: cfg!(debug_assertions),
            fence_timeout_ms: 5_000,
            shader_dir: None,
            show_grid: true,
            pipeline_cache: true,
        }
    }
}

impl Default for TerrainCfg {
    fn default() -> Self {
        TerrainCfg {
            width: 64,
            height: 64,
            amplitude: 6,
            seed: 1,
        }
    }
}

impl Default for CameraCfg {
    fn default() -> Self {
        CameraCfg {
            zoom: 0,
            pan_step: 1.0,
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}

impl RenderCfg {
    pub fn to_options(&self) -> VkRendererOptions {
        VkRendererOptions {
            clear_color: self.clear_color,
            vsync: match self.vsync_mode {
                VsyncModeCfg::Fifo => VsyncMode::Fifo,
                VsyncModeCfg::Mailbox => VsyncMode::Mailbox,
            },
            validation: self.validation,
            // A zero timeout would fail every frame that is not already done.
            fence_timeout: Duration::from_millis(self.fence_timeout_ms.max(1)),
            shaders: match &self.shader_dir {
                Some(dir) => ShaderSource::Directory(dir.clone()),
                None => ShaderSource::Embedded,
            },
            show_grid: self.show_grid,
            pipeline_cache: self.pipeline_cache,
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str::<AppCfg>(text)
}

/// Missing file means defaults; a malformed one is reported and ignored.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => match parse_cfg(&s) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("{}: {e}; using defaults", path.display());
                AppCfg::default()
            }
        },
        Err(_) => AppCfg::default(),
    }
}
