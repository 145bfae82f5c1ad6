// SPDX-License-Identifier: CEPL-1.0
//! Procedural heightmap so the renderer has something to show.

use anyhow::Result;
use strata_render::{Heightmap, TerrainSource, TileCorners};

use crate::config::TerrainCfg;

/// One tile in this many is lifted into a cliff-edged plateau.
const CLIFF_ODDS: u64 = 11;
const CLIFF_RISE: i8 = 2;

fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Uniform in `[-1, 1]` for each corner, stable for a given seed.
fn jitter(seed: u64, x: u32, y: u32) -> f32 {
    let h = mix(seed ^ mix(((x as u64) << 32) | y as u64));
    (h >> 40) as f32 / (1u64 << 23) as f32 - 1.0
}

fn lifted(seed: u64, x: u32, y: u32) -> bool {
    mix(seed.rotate_left(29) ^ mix(((x as u64) << 32) | y as u64)) % CLIFF_ODDS == 0
}

/// Rolling hills plus a little per-corner noise, quantised to height steps.
/// A few tiles are lifted off the shared surface so walls get drawn.
pub fn heightmap(cfg: &TerrainCfg) -> Result<Heightmap> {
    let (w, h) = (cfg.width, cfg.height);
    let amp = f32::from(cfg.amplitude.max(0));
    let phase = (mix(cfg.seed) % 628) as f32 / 100.0;

    let mut corners = Vec::with_capacity((w as usize + 1) * (h as usize + 1));
    for y in 0..=h {
        for x in 0..=w {
            let hills = (x as f32 * 0.21 + phase).sin() * (y as f32 * 0.17 - phase).cos();
            let e = amp * (0.8 * hills + 0.2 * jitter(cfg.seed, x, y));
            corners.push(e.round().clamp(-amp, amp) as i8);
        }
    }
    let mut map = Heightmap::from_corner_grid(w, h, &corners)?;

    let top = cfg.amplitude.max(0);
    for y in 0..h {
        for x in 0..w {
            if !lifted(cfg.seed, x, y) {
                continue;
            }
            let c = map.corners(x, y);
            let lift = |e: i8| e.saturating_add(CLIFF_RISE).min(top);
            map.set(x, y, TileCorners::new(lift(c.nw), lift(c.ne), lift(c.sw), lift(c.se)));
        }
    }
    Ok(map)
}
